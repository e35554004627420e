//! ELM/STN Scan-Tool Device
//!
//! Drives an ELM327-class interpreter over a serial port: AT dialogue for
//! setup, hex-line frame traffic afterwards. A background thread drains the
//! port into the shared frame queue so slow hosts never lose bus traffic.
//!
//! These interpreters are capped at standard VPW speed; `supports_4x` is
//! always false here. Pass-through hardware that can do 41.6 kbit/s plugs in
//! as its own `Device` implementation.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serialport::{SerialPort, SerialPortType};
use tracing::{debug, info, warn};

use crate::device::{Device, DeviceCapabilities, FrameQueue, TimeoutScenario, VpwSpeed};
use crate::error::{ObdError, Result};
use crate::frame::VpwFrame;

const BAUD_RATE: u32 = 115_200;
const QUEUE_CAPACITY: usize = 512;
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Information about a serial port, for device pickers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortInfo {
    pub name: String,
    pub port_type: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub product: Option<String>,
    pub is_ftdi: bool,
}

/// Lists serial ports, flagging the FTDI-based cables most scan tools use.
pub fn list_ports() -> Result<Vec<PortInfo>> {
    let ports = serialport::available_ports()?;
    Ok(ports
        .into_iter()
        .map(|p| match &p.port_type {
            SerialPortType::UsbPort(usb) => PortInfo {
                name: p.port_name.clone(),
                port_type: "USB".to_string(),
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                product: usb.product.clone(),
                is_ftdi: usb.vid == 0x0403,
            },
            other => PortInfo {
                name: p.port_name.clone(),
                port_type: format!("{other:?}"),
                vid: None,
                pid: None,
                product: None,
                is_ftdi: false,
            },
        })
        .collect())
}

/// ELM327/STN11xx scan tool on a serial port.
pub struct ElmDevice {
    port_name: String,
    capabilities: DeviceCapabilities,
    scenario: TimeoutScenario,
    queue: FrameQueue,
    port: Option<Box<dyn SerialPort>>,
    pump: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    voltage: f64,
    session_start: Instant,
}

impl ElmDevice {
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            capabilities: DeviceCapabilities {
                // The interpreter's line buffer bounds frame size well below
                // what pass-through hardware manages.
                max_send_size: 192 + 12,
                max_receive_size: 500 + 12,
                max_kernel_send_size: 192 + 12,
                max_flash_write_send_size: 192 + 12,
                supports_4x: false,
                ..DeviceCapabilities::default()
            },
            scenario: TimeoutScenario::Minimum,
            queue: FrameQueue::new(QUEUE_CAPACITY),
            port: None,
            pump: None,
            stop: Arc::new(AtomicBool::new(false)),
            voltage: 0.0,
            session_start: Instant::now(),
        }
    }

    fn scenario_millis(&self) -> u64 {
        match self.scenario {
            TimeoutScenario::Minimum => 50,
            TimeoutScenario::ReadProperty => 500,
            TimeoutScenario::ReadMemoryBlock => 2500,
            TimeoutScenario::SendKernel => 4000,
            TimeoutScenario::ReadCrc => 5000,
            TimeoutScenario::DataLogging => 250,
            TimeoutScenario::Maximum => 10_000,
        }
    }

    /// Sends an AT command and returns the interpreter's reply, up to the
    /// prompt character. Only valid before the pump thread starts.
    fn command(port: &mut dyn SerialPort, command: &str) -> Result<String> {
        debug!("ELM TX: {command}");
        port.write_all(command.as_bytes())?;
        port.write_all(b"\r")?;
        port.flush()?;

        let deadline = Instant::now() + Duration::from_millis(2000);
        let mut reply = String::new();
        let mut buf = [0u8; 64];
        while Instant::now() < deadline {
            match port.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    for &b in &buf[..n] {
                        if b == b'>' {
                            let trimmed = reply.trim().to_string();
                            debug!("ELM RX: {trimmed}");
                            return Ok(trimmed);
                        }
                        reply.push(b as char);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => return Err(e.into()),
            }
        }
        Err(ObdError::protocol(format!(
            "no prompt after {command:?}: got {reply:?}"
        )))
    }

    fn expect_ok(port: &mut dyn SerialPort, command: &str) -> Result<()> {
        let reply = Self::command(port, command)?;
        if reply.contains("OK") || reply.contains("ELM") || reply.contains("STN") {
            Ok(())
        } else {
            Err(ObdError::protocol(format!(
                "interpreter rejected {command:?}: {reply:?}"
            )))
        }
    }

    fn spawn_pump(&mut self, reader: Box<dyn SerialPort>) {
        let queue = self.queue.clone();
        let stop = self.stop.clone();
        let started = self.session_start;
        self.pump = Some(thread::spawn(move || {
            pump_loop(reader, queue, stop, started);
        }));
    }
}

/// Reads hex lines off the port and turns them into frames until told to
/// stop.
fn pump_loop(
    mut reader: Box<dyn SerialPort>,
    queue: FrameQueue,
    stop: Arc<AtomicBool>,
    started: Instant,
) {
    let mut pending = String::new();
    let mut buf = [0u8; 256];
    while !stop.load(Ordering::SeqCst) {
        match reader.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                for &b in &buf[..n] {
                    match b {
                        b'\r' | b'\n' | b'>' => {
                            if !pending.is_empty() {
                                let line = std::mem::take(&mut pending);
                                if let Some(bytes) = parse_hex_line(&line) {
                                    let stamp = started.elapsed().as_micros() as u64;
                                    queue.push(VpwFrame::received(bytes, stamp, 0));
                                } else {
                                    debug!("ELM non-frame line: {line:?}");
                                }
                            }
                        }
                        other => pending.push(other as char),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                warn!("receive pump stopping: {e}");
                break;
            }
        }
    }
}

/// Decodes a line of hex pairs (with or without spaces) into frame bytes.
/// Returns `None` for status lines like `OK`, `NO DATA`, or `STOPPED`.
fn parse_hex_line(line: &str) -> Option<Vec<u8>> {
    let cleaned: String = line.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.len() < 8 || cleaned.len() % 2 != 0 {
        return None;
    }
    let mut bytes = Vec::with_capacity(cleaned.len() / 2);
    let raw = cleaned.as_bytes();
    for pair in raw.chunks(2) {
        let hi = (pair[0] as char).to_digit(16)?;
        let lo = (pair[1] as char).to_digit(16)?;
        bytes.push((hi * 16 + lo) as u8);
    }
    Some(bytes)
}

fn encode_hex(frame: &VpwFrame) -> String {
    let mut line = String::with_capacity(frame.len() * 2 + 1);
    for b in frame.as_bytes() {
        line.push_str(&format!("{b:02X}"));
    }
    line
}

#[async_trait]
impl Device for ElmDevice {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    async fn initialize(&mut self) -> Result<()> {
        info!("opening {} at {BAUD_RATE} baud", self.port_name);
        let mut port = serialport::new(&self.port_name, BAUD_RATE)
            .timeout(Duration::from_millis(50))
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()?;

        Self::expect_ok(port.as_mut(), "ATZ")?;
        Self::expect_ok(port.as_mut(), "ATE0")?;
        // Headers on, spaces off: the core wants every byte of every frame.
        Self::expect_ok(port.as_mut(), "ATH1")?;
        Self::expect_ok(port.as_mut(), "ATS0")?;
        // SAE J1850 VPW at 10.4 kbit/s.
        Self::expect_ok(port.as_mut(), "ATSP2")?;
        // Adaptive timing off; the core runs its own retry fabric.
        Self::expect_ok(port.as_mut(), "ATAT0")?;
        // Only frames addressed to the tool reach the queue.
        Self::expect_ok(port.as_mut(), "ATRA F0")?;

        let reply = Self::command(port.as_mut(), "ATRV")?;
        self.voltage = reply
            .trim_end_matches('V')
            .trim()
            .parse()
            .unwrap_or_else(|_| {
                warn!("unparseable voltage reply: {reply:?}");
                0.0
            });
        info!("battery voltage: {:.1} V", self.voltage);

        let reader = port.try_clone()?;
        self.port = Some(port);
        self.spawn_pump(reader);
        Ok(())
    }

    async fn send_message(&mut self, frame: &VpwFrame) -> Result<()> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| ObdError::protocol("device not initialized"))?;
        let line = encode_hex(frame);
        debug!("TX: {:02X?}", frame.as_bytes());
        port.write_all(line.as_bytes())?;
        port.write_all(b"\r")?;
        port.flush()?;
        Ok(())
    }

    async fn receive_message(&mut self) -> Option<VpwFrame> {
        let deadline = Instant::now() + Duration::from_millis(self.scenario_millis());
        loop {
            if let Some(frame) = self.queue.pop() {
                debug!("RX: {:02X?}", frame.as_bytes());
                return Some(frame);
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn set_timeout(&mut self, scenario: TimeoutScenario) -> Result<TimeoutScenario> {
        debug!("timeout scenario: {scenario:?}");
        Ok(std::mem::replace(&mut self.scenario, scenario))
    }

    async fn set_vpw_speed(&mut self, speed: VpwSpeed) -> Result<()> {
        match speed {
            VpwSpeed::Standard => Ok(()),
            VpwSpeed::FourX => Err(ObdError::protocol(
                "ELM-class interpreters cannot signal at 4x",
            )),
        }
    }

    fn clear_message_queue(&mut self) {
        self.queue.clear();
    }

    async fn clear_message_buffer(&mut self) -> Result<()> {
        if let Some(port) = self.port.as_mut() {
            port.clear(serialport::ClearBuffer::All)?;
        }
        self.queue.clear();
        Ok(())
    }

    async fn read_voltage(&mut self) -> Result<f64> {
        // Measured during initialize; the interpreter's command channel is
        // owned by frame traffic once the pump is running.
        Ok(self.voltage)
    }

    fn describe(&self) -> String {
        format!("ELM/STN on {}", self.port_name)
    }
}

impl Drop for ElmDevice {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_lines_decode() {
        assert_eq!(
            parse_hex_line("6C F0 10 7C 01"),
            Some(vec![0x6C, 0xF0, 0x10, 0x7C, 0x01])
        );
        assert_eq!(
            parse_hex_line("6CF0107C"),
            Some(vec![0x6C, 0xF0, 0x10, 0x7C])
        );
    }

    #[test]
    fn status_lines_are_not_frames() {
        assert_eq!(parse_hex_line("OK"), None);
        assert_eq!(parse_hex_line("NO DATA"), None);
        assert_eq!(parse_hex_line("STOPPED"), None);
        assert_eq!(parse_hex_line(""), None);
    }

    #[test]
    fn frames_encode_as_plain_hex() {
        let frame = VpwFrame::new(vec![0x6C, 0x10, 0xF0, 0x3C, 0x01]);
        assert_eq!(encode_hex(&frame), "6C10F03C01");
    }
}
