//! Per-driver line configuration
//!
//! Every chip family takes baud rate and framing through its own control
//! requests. This module only computes those requests; issuing them is the
//! port's job, so the encodings can be checked without hardware.

use common::{DataBits, DriverKind, LineParameters, Parity, StopBits, TransportError};

/// One control OUT transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub data: Vec<u8>,
}

impl ControlRequest {
    fn new(request_type: u8, request: u8, value: u16, index: u16) -> Self {
        Self {
            request_type,
            request,
            value,
            index,
            data: Vec::new(),
        }
    }

    fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }
}

/// Class request to an interface (host to device)
const CLASS_INTERFACE_OUT: u8 = 0x21;
/// Vendor request to the device (host to device)
const VENDOR_DEVICE_OUT: u8 = 0x40;
/// Vendor request to an interface (host to device)
const VENDOR_INTERFACE_OUT: u8 = 0x41;

const CDC_SET_LINE_CODING: u8 = 0x20;

const CP21XX_IFC_ENABLE: u8 = 0x00;
const CP21XX_SET_LINE_CTL: u8 = 0x03;
const CP21XX_SET_BAUDRATE: u8 = 0x1E;

const FTDI_SET_BAUD_RATE: u8 = 0x03;
const FTDI_SET_DATA: u8 = 0x04;
const FTDI_BASE_CLOCK: u32 = 3_000_000;

const CH34X_WRITE_REG: u8 = 0x9A;
const CH34X_REG_PRESCALER: u16 = 0x1312;
const CH34X_REG_DIVISOR: u16 = 0x0f2c;
const CH34X_REG_LCR: u16 = 0x2518;
const CH34X_BAUDBASE_FACTOR: u64 = 1_532_620_800;
const CH34X_BAUDBASE_DIVMAX: u16 = 3;

/// Requests that switch the chip on before it is configured
pub fn enable_requests(driver: DriverKind, interface: u8) -> Vec<ControlRequest> {
    match driver {
        DriverKind::Cp21xx => vec![ControlRequest::new(
            VENDOR_INTERFACE_OUT,
            CP21XX_IFC_ENABLE,
            1,
            interface as u16,
        )],
        _ => Vec::new(),
    }
}

/// Requests applying `params` to a `driver` port on `interface`
pub fn line_coding_requests(
    driver: DriverKind,
    params: &LineParameters,
    interface: u8,
) -> Result<Vec<ControlRequest>, TransportError> {
    match driver {
        DriverKind::CdcAcm | DriverKind::Prolific => Ok(vec![cdc_line_coding(params, interface)]),
        DriverKind::Cp21xx => Ok(cp21xx_line_coding(params, interface)),
        DriverKind::Ftdi => ftdi_line_coding(params, interface),
        DriverKind::Ch34x => ch34x_line_coding(params),
        DriverKind::CommonUsb | DriverKind::Unknown => Err(TransportError::UnsupportedParameter(
            format!("{} ports take no line configuration", driver),
        )),
    }
}

fn cdc_line_coding(params: &LineParameters, interface: u8) -> ControlRequest {
    let mut data = params.baud_rate.to_le_bytes().to_vec();
    data.push(stop_code(params.stop_bits));
    data.push(params.parity.code());
    data.push(params.data_bits.bits());
    ControlRequest::new(CLASS_INTERFACE_OUT, CDC_SET_LINE_CODING, 0, interface as u16)
        .with_data(data)
}

fn cp21xx_line_coding(params: &LineParameters, interface: u8) -> Vec<ControlRequest> {
    let index = interface as u16;
    let line_ctl = ((params.data_bits.bits() as u16) << 8)
        | ((params.parity.code() as u16) << 4)
        | stop_code(params.stop_bits) as u16;
    vec![
        ControlRequest::new(VENDOR_INTERFACE_OUT, CP21XX_SET_BAUDRATE, 0, index)
            .with_data(params.baud_rate.to_le_bytes().to_vec()),
        ControlRequest::new(VENDOR_INTERFACE_OUT, CP21XX_SET_LINE_CTL, line_ctl, index),
    ]
}

fn ftdi_line_coding(
    params: &LineParameters,
    interface: u8,
) -> Result<Vec<ControlRequest>, TransportError> {
    let divisor = ftdi_divisor(params.baud_rate)?;
    // Port A is 1 on multi-port chips
    let port = interface as u16 + 1;
    let value = (divisor & 0xFFFF) as u16;
    let high = (divisor >> 16) as u16;
    let baud_index = if interface == 0 { high } else { (high << 8) | port };
    let data = params.data_bits.bits() as u16
        | ((params.parity.code() as u16) << 8)
        | ((stop_code(params.stop_bits) as u16) << 11);
    Ok(vec![
        ControlRequest::new(VENDOR_DEVICE_OUT, FTDI_SET_BAUD_RATE, value, baud_index),
        ControlRequest::new(VENDOR_DEVICE_OUT, FTDI_SET_DATA, data, port),
    ])
}

/// FTDI fractional baud divisor (17 bits: 14 integer, 3 fraction)
pub fn ftdi_divisor(baud_rate: u32) -> Result<u32, TransportError> {
    const FRACTION: [u32; 8] = [0, 3, 2, 4, 1, 5, 6, 7];

    if baud_rate == 0 || baud_rate > FTDI_BASE_CLOCK {
        return Err(unsupported_baud(baud_rate));
    }
    let divisor8 = (FTDI_BASE_CLOCK * 8 + baud_rate / 2) / baud_rate;
    if divisor8 >> 3 > 0x3FFF {
        return Err(unsupported_baud(baud_rate));
    }

    let encoded = (divisor8 >> 3) | (FRACTION[(divisor8 & 7) as usize] << 14);
    // Divisors 1 and 1.5 have dedicated codes
    Ok(match encoded {
        1 => 0,
        0x4001 => 1,
        other => other,
    })
}

fn ch34x_line_coding(params: &LineParameters) -> Result<Vec<ControlRequest>, TransportError> {
    let (prescaler, divisor) = ch34x_baud(params.baud_rate)?;
    let lcr = ch34x_lcr(params)?;
    Ok(vec![
        ControlRequest::new(VENDOR_DEVICE_OUT, CH34X_WRITE_REG, CH34X_REG_PRESCALER, prescaler),
        ControlRequest::new(VENDOR_DEVICE_OUT, CH34X_WRITE_REG, CH34X_REG_DIVISOR, divisor),
        ControlRequest::new(VENDOR_DEVICE_OUT, CH34X_WRITE_REG, CH34X_REG_LCR, lcr),
    ])
}

/// CH34x prescaler and divisor register values for `baud_rate`
pub fn ch34x_baud(baud_rate: u32) -> Result<(u16, u16), TransportError> {
    if baud_rate == 0 {
        return Err(unsupported_baud(baud_rate));
    }

    let (factor, divisor) = if baud_rate == 921_600 {
        (0xf300_u64, 7_u16)
    } else {
        let mut factor = CH34X_BAUDBASE_FACTOR / baud_rate as u64;
        let mut divisor = CH34X_BAUDBASE_DIVMAX;
        while factor > 0xfff0 && divisor > 0 {
            factor >>= 3;
            divisor -= 1;
        }
        if factor == 0 || factor > 0xfff0 {
            return Err(unsupported_baud(baud_rate));
        }
        (0x10000 - factor, divisor)
    };

    let divisor = divisor | 0x80;
    let factor = factor as u16;
    Ok(((factor & 0xff00) | divisor, factor & 0x00ff))
}

fn ch34x_lcr(params: &LineParameters) -> Result<u16, TransportError> {
    let mut lcr: u16 = 0xC0;
    lcr |= match params.data_bits {
        DataBits::Five => 0x00,
        DataBits::Six => 0x01,
        DataBits::Seven => 0x02,
        DataBits::Eight => 0x03,
    };
    lcr |= match params.parity {
        Parity::None => 0x00,
        Parity::Odd => 0x08,
        Parity::Even => 0x18,
        Parity::Mark => 0x28,
        Parity::Space => 0x38,
    };
    lcr |= match params.stop_bits {
        StopBits::One => 0x00,
        StopBits::Two => 0x04,
        StopBits::OnePointFive => {
            return Err(TransportError::UnsupportedParameter(
                "1.5 stop bits on ch34x".to_string(),
            ));
        }
    };
    Ok(lcr)
}

/// Stop bits as encoded in CDC line coding: 0 = 1, 1 = 1.5, 2 = 2
fn stop_code(stop_bits: StopBits) -> u8 {
    match stop_bits {
        StopBits::One => 0,
        StopBits::OnePointFive => 1,
        StopBits::Two => 2,
    }
}

fn unsupported_baud(baud_rate: u32) -> TransportError {
    TransportError::UnsupportedParameter(format!("baud rate {}", baud_rate))
}
