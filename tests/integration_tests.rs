//! End-to-end scenarios against the scripted mock device.
//!
//! Every test drives the public vehicle API with literal frame bytes on the
//! wire, the way a real PCM would answer them.

use std::sync::{Arc, Mutex};

use crc::{Crc, CRC_32_ISO_HDLC};

use pcmlink::device::DeviceCapabilities;
use pcmlink::mock::MockDevice;
use pcmlink::pcm::PcmInfo;
use pcmlink::protocol::mode;
use pcmlink::status::StatusObserver;
use pcmlink::{CancelToken, ObdError, SeedKeyAlgorithm, Vehicle, VpwFrame, VpwSpeed};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

fn frame(bytes: &[u8]) -> VpwFrame {
    VpwFrame::new(bytes.to_vec())
}

fn test_key_algorithm() -> Box<dyn SeedKeyAlgorithm> {
    Box::new(|algorithm_id: u8, seed: u16| {
        if algorithm_id == 40 && seed == 0x1234 {
            Some(0xABCD)
        } else {
            None
        }
    })
}

async fn vehicle_with(device: MockDevice) -> Vehicle {
    let mut vehicle = Vehicle::new(Box::new(device), test_key_algorithm());
    vehicle.init().await.expect("mock init cannot fail");
    vehicle
}

/// Collects user messages so tests can assert on what an operator would see.
#[derive(Default)]
struct RecordingObserver {
    user_messages: Mutex<Vec<String>>,
}

impl StatusObserver for RecordingObserver {
    fn add_user_message(&self, message: &str) {
        self.user_messages
            .lock()
            .expect("observer poisoned")
            .push(message.to_string());
    }
}

impl RecordingObserver {
    fn messages(&self) -> Vec<String> {
        self.user_messages.lock().expect("observer poisoned").clone()
    }
}

#[tokio::test(start_paused = true)]
async fn vin_read_assembles_three_blocks() {
    let mut device = MockDevice::new();
    device.stage_reply(frame(&[
        0x6C, 0xF0, 0x10, 0x7C, 0x01, 0x06, 0x31, 0x47, 0x4E, 0x45, 0x4B,
    ]));
    device.stage_reply(frame(&[
        0x6C, 0xF0, 0x10, 0x7C, 0x02, 0x4E, 0x52, 0x39, 0x4A, 0x36, 0x31,
    ]));
    device.stage_reply(frame(&[
        0x6C, 0xF0, 0x10, 0x7C, 0x03, 0x4D, 0x32, 0x33, 0x33, 0x34, 0x35,
    ]));

    let mut vehicle = vehicle_with(device).await;
    assert_eq!(vehicle.query_vin().await.unwrap(), "1GNEKNR9J61M23345");
}

#[tokio::test(start_paused = true)]
async fn vin_read_reports_the_failing_block() {
    let mut device = MockDevice::new();
    device.stage_reply(frame(&[
        0x6C, 0xF0, 0x10, 0x7C, 0x01, 0x06, 0x31, 0x47, 0x4E, 0x45, 0x4B,
    ]));
    // Block 2 never answers.

    let mut vehicle = vehicle_with(device).await;
    assert!(matches!(
        vehicle.query_vin().await,
        Err(ObdError::Timeout)
    ));
}

#[tokio::test(start_paused = true)]
async fn unlock_happy_path_sends_one_seed_and_one_key() {
    let mut device = MockDevice::new();
    let log = device.log();
    device.stage_reply(frame(&[0x6C, 0xF0, 0x10, 0x67, 0x01, 0x12, 0x34]));
    device.stage_reply(frame(&[0x6C, 0xF0, 0x10, 0x67, 0x02, 0x34]));

    let mut vehicle = vehicle_with(device).await;
    assert!(vehicle.unlock_ecu(40).await.unwrap());

    let security: Vec<VpwFrame> = log
        .sent_frames()
        .into_iter()
        .filter(|f| f.mode() == mode::SECURITY_ACCESS)
        .collect();
    assert_eq!(security.len(), 2);
    assert_eq!(security[0].as_bytes(), &[0x6C, 0x10, 0xF0, 0x27, 0x01]);
    assert_eq!(
        security[1].as_bytes(),
        &[0x6C, 0x10, 0xF0, 0x27, 0x02, 0xAB, 0xCD]
    );
}

#[tokio::test(start_paused = true)]
async fn unlock_skips_the_key_when_already_unlocked() {
    let mut device = MockDevice::new();
    let log = device.log();
    device.stage_reply(frame(&[0x6C, 0xF0, 0x10, 0x67, 0x01, 0x37]));

    let mut vehicle = vehicle_with(device).await;
    assert!(vehicle.unlock_ecu(40).await.unwrap());
    assert_eq!(log.sends_of_mode(mode::SECURITY_ACCESS), 1);
}

#[tokio::test(start_paused = true)]
async fn unlock_with_unknown_algorithm_is_a_visible_error() {
    let mut device = MockDevice::new();
    device.stage_reply(frame(&[0x6C, 0xF0, 0x10, 0x67, 0x01, 0x12, 0x34]));

    let observer = Arc::new(RecordingObserver::default());
    let mut vehicle = Vehicle::new(Box::new(device), test_key_algorithm())
        .with_status(observer.clone());
    vehicle.init().await.unwrap();

    assert!(vehicle.unlock_ecu(99).await.is_err());
    assert!(observer
        .messages()
        .iter()
        .any(|m| m.contains("key algorithm")));
}

fn read_reply(address: u32, payload: &[u8]) -> VpwFrame {
    let mut bytes = vec![
        0x6D,
        0xF0,
        0x10,
        0x36,
        0x01,
        (payload.len() >> 8) as u8,
        (payload.len() & 0xFF) as u8,
        (address >> 16) as u8,
        (address >> 8) as u8,
        (address & 0xFF) as u8,
    ];
    bytes.extend_from_slice(payload);
    let sum: u16 = bytes.iter().fold(0u16, |acc, &b| acc.wrapping_add(b as u16));
    bytes.push((sum >> 8) as u8);
    bytes.push((sum & 0xFF) as u8);
    VpwFrame::new(bytes)
}

#[tokio::test(start_paused = true)]
async fn corrupt_read_block_fails_and_leaves_the_image_alone() {
    let mut device = MockDevice::new();
    let reply = read_reply(0x4000, &[0x11, 0x22, 0x33, 0x44]);
    let mut bytes = reply.as_bytes().to_vec();
    let last = bytes.len() - 1;
    bytes[last] = bytes[last].wrapping_add(1);
    device.stage_reply(VpwFrame::new(bytes));

    let mut vehicle = vehicle_with(device).await;
    let mut image = vec![0xFF; 0x8000];
    let cancel = CancelToken::new();
    let result = vehicle
        .read_memory_block(&mut image, 0x4000, 4, &cancel)
        .await;

    assert!(matches!(result, Err(ObdError::Protocol(_))));
    assert_eq!(&image[0x4000..0x4004], &[0xFF, 0xFF, 0xFF, 0xFF]);
}

/// Installs a handler that plays the part of a P01 with a running kernel
/// over `source` as flash contents.
fn install_pcm_handler(
    device: &mut MockDevice,
    source: Arc<Vec<u8>>,
    cancel_after_reads: Option<(usize, CancelToken)>,
) {
    let mut reads_served = 0usize;
    device.set_frame_handler(Box::new(move |request: &VpwFrame| {
        match request.mode() {
            mode::SECURITY_ACCESS if request.submode() == 0x01 => {
                vec![frame(&[0x6C, 0xF0, 0x10, 0x67, 0x01, 0x37])]
            }
            mode::UPLOAD_REQUEST => vec![frame(&[0x6C, 0xF0, 0x10, 0x74, 0x00])],
            mode::UPLOAD => vec![frame(&[0x6D, 0xF0, 0x10, 0x76, 0x00])],
            mode::KERNEL_INFO => match request.submode() {
                0x00 => vec![frame(&[0x6D, 0xF0, 0x10, 0x7D, 0x00, 0x00, 0x00, 0x00, 0x01])],
                0x01 => vec![frame(&[0x6D, 0xF0, 0x10, 0x7D, 0x01, 0x00, 0x89, 0x44, 0x71])],
                0x02 => {
                    let bytes = request.as_bytes();
                    let length =
                        u32::from_be_bytes([0, bytes[5], bytes[6], bytes[7]]) as usize;
                    let address =
                        u32::from_be_bytes([0, bytes[8], bytes[9], bytes[10]]) as usize;
                    let crc = CRC32.checksum(&source[address..address + length]);
                    let mut reply = vec![0x6D, 0xF0, 0x10, 0x7D, 0x02];
                    reply.extend_from_slice(&bytes[5..11]);
                    reply.extend_from_slice(&crc.to_be_bytes());
                    vec![VpwFrame::new(reply)]
                }
                _ => Vec::new(),
            },
            mode::READ_MEMORY => {
                if let Some((limit, token)) = &cancel_after_reads {
                    if reads_served >= *limit {
                        token.cancel();
                        return Vec::new();
                    }
                }
                reads_served += 1;
                let bytes = request.as_bytes();
                let length = u16::from_be_bytes([bytes[5], bytes[6]]) as usize;
                let address =
                    u32::from_be_bytes([0, bytes[7], bytes[8], bytes[9]]) as usize;
                vec![read_reply(
                    address as u32,
                    &source[address..address + length],
                )]
            }
            _ => Vec::new(),
        }
    }));
}

fn p01_source_image() -> Arc<Vec<u8>> {
    let image: Vec<u8> = (0..0x80000usize)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add((i >> 8) as u8))
        .collect();
    Arc::new(image)
}

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[tokio::test(start_paused = true)]
async fn bulk_read_returns_the_image_and_verifies_crcs() {
    init_logging();
    let source = p01_source_image();
    let mut device = MockDevice::new();
    let log = device.log();
    install_pcm_handler(&mut device, source.clone(), None);

    let observer = Arc::new(RecordingObserver::default());
    let mut vehicle = Vehicle::new(Box::new(device), test_key_algorithm())
        .with_status(observer.clone());
    vehicle.init().await.unwrap();

    let info = PcmInfo::p01(0x80000);
    let kernel = vec![0x4E; 3072];
    let cancel = CancelToken::new();
    let image = vehicle
        .read_contents(&info, None, &kernel, &cancel)
        .await
        .unwrap()
        .expect("read should complete");

    assert_eq!(image.len(), source.len());
    assert_eq!(&image, source.as_ref());

    let messages = observer.messages();
    assert!(messages.iter().any(|m| m.contains("Intel 28F400B")));
    assert!(messages.iter().any(|m| m.ends_with("match")));
    assert!(!messages.iter().any(|m| m.contains("MISMATCH")));

    // Cleanup ran: kernel exit at both speeds, doubled clear frames.
    assert_eq!(log.sends_of_mode(mode::EXIT_KERNEL), 2);
    assert_eq!(log.sends_of_mode(mode::CLEAR_DTCS), 4);
}

#[tokio::test(start_paused = true)]
async fn bulk_read_cancellation_stops_cleanly_and_still_cleans_up() {
    init_logging();
    let source = p01_source_image();
    let cancel = CancelToken::new();
    let mut device = MockDevice::new().with_capabilities(DeviceCapabilities {
        max_receive_size: 1024 + 12,
        supports_4x: true,
        ..DeviceCapabilities::default()
    });
    let log = device.log();
    install_pcm_handler(&mut device, source, Some((3, cancel.clone())));

    let mut vehicle = vehicle_with(device).await;
    let info = PcmInfo::p01(0x80000);
    let kernel = vec![0x4E; 3072];
    let image = vehicle
        .read_contents(&info, None, &kernel, &cancel)
        .await
        .unwrap();

    assert!(image.is_none());
    // Three served blocks plus the boundary send that triggered the cancel.
    assert_eq!(log.sends_of_mode(mode::READ_MEMORY), 4);
    // Cleanup happened exactly once.
    assert_eq!(log.sends_of_mode(mode::EXIT_KERNEL), 2);
    assert_eq!(log.sends_of_mode(mode::CLEAR_DTCS), 4);
    assert_eq!(log.current_speed(), VpwSpeed::Standard);
}

#[tokio::test(start_paused = true)]
async fn kernel_upload_descends_and_executes_last() {
    let source = p01_source_image();
    let mut device = MockDevice::new();
    let log = device.log();
    install_pcm_handler(&mut device, source, None);

    let mut vehicle = vehicle_with(device).await;
    let mut info = PcmInfo::p01(0x80000);
    let kernel = vec![0x4E; 10_000];
    let cancel = CancelToken::new();
    vehicle
        .pcm_execute(&mut info, &kernel, &cancel)
        .await
        .unwrap();

    let uploads: Vec<VpwFrame> = log
        .sent_frames()
        .into_iter()
        .filter(|f| f.mode() == mode::UPLOAD)
        .collect();
    assert_eq!(uploads.len(), 3);

    let addresses: Vec<u32> = uploads
        .iter()
        .map(|f| {
            let b = f.as_bytes();
            u32::from_be_bytes([0, b[7], b[8], b[9]])
        })
        .collect();
    let mut sorted = addresses.clone();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    assert_eq!(addresses, sorted, "addresses must strictly descend");
    assert_eq!(*addresses.last().unwrap(), info.kernel_base_address);

    let copy_types: Vec<u8> = uploads.iter().map(|f| f.submode()).collect();
    assert_eq!(copy_types[..2], [0x00, 0x00]);
    assert_eq!(copy_types[2], 0x80);

    // The permission request declared no more than 4 KiB.
    let request = log
        .sent_frames()
        .into_iter()
        .find(|f| f.mode() == mode::UPLOAD_REQUEST)
        .unwrap();
    assert_eq!(
        request.as_bytes(),
        &[0x6C, 0x10, 0xF0, 0x34, 0x10, 0x00, 0xFF, 0x80, 0x00]
    );
}

#[tokio::test(start_paused = true)]
async fn four_x_refusal_keeps_the_bus_at_standard_speed() {
    let mut device = MockDevice::new();
    let log = device.log();
    device.stage_replies(vec![
        frame(&[0x6C, 0xF0, 0x40, 0xE0, 0x01]),
        frame(&[0x6C, 0xF0, 0x60, 0xE0, 0x01]),
        frame(&[0x6C, 0xF0, 0x58, 0xE0, 0x00]),
    ]);

    let mut vehicle = vehicle_with(device).await;
    let result = vehicle.set_vpw_4x().await;

    assert!(matches!(result, Err(ObdError::Protocol(_))));
    assert_eq!(log.sends_of_mode(mode::HIGH_SPEED), 0);
    assert_eq!(log.current_speed(), VpwSpeed::Standard);
}

#[tokio::test(start_paused = true)]
async fn four_x_consent_switches_the_device() {
    let mut device = MockDevice::new();
    let log = device.log();
    device.stage_replies(vec![
        frame(&[0x6C, 0xF0, 0x40, 0xE0, 0x01]),
        frame(&[0x6C, 0xF0, 0x10, 0xE0, 0x01]),
    ]);

    let mut vehicle = vehicle_with(device).await;
    vehicle.set_vpw_4x().await.unwrap();

    assert_eq!(log.sends_of_mode(mode::HIGH_SPEED), 1);
    assert_eq!(log.current_speed(), VpwSpeed::FourX);
}

#[tokio::test(start_paused = true)]
async fn serial_and_bcc_reads() -> anyhow::Result<()> {
    let mut device = MockDevice::new();
    device.stage_reply(frame(&[0x6C, 0xF0, 0x10, 0x7C, 0x05, 0x31, 0x32, 0x33, 0x34]));
    device.stage_reply(frame(&[0x6C, 0xF0, 0x10, 0x7C, 0x06, 0x35, 0x36, 0x37, 0x38]));
    device.stage_reply(frame(&[0x6C, 0xF0, 0x10, 0x7C, 0x07, 0x39, 0x41, 0x42, 0x43]));
    device.stage_reply(frame(&[0x6C, 0xF0, 0x10, 0x7C, 0x14, 0x42, 0x4A, 0x52, 0x4B]));

    let mut vehicle = vehicle_with(device).await;
    assert_eq!(vehicle.query_serial().await?, "123456789ABC");
    assert_eq!(vehicle.query_bcc().await?, "BJRK");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn os_id_is_big_endian() {
    let mut device = MockDevice::new();
    device.stage_reply(frame(&[
        0x6C, 0xF0, 0x10, 0x7C, 0x0A, 0x00, 0xBC, 0x61, 0x4E,
    ]));

    let mut vehicle = vehicle_with(device).await;
    assert_eq!(vehicle.query_operating_system_id().await.unwrap(), 0x00BC614E);
}

#[test]
fn pcm_descriptions_round_trip_through_json() {
    let info = PcmInfo::p59();
    let json = serde_json::to_string(&info).unwrap();
    let back: PcmInfo = serde_json::from_str(&json).unwrap();
    assert_eq!(back.hardware_type, info.hardware_type);
    assert_eq!(back.image_size, info.image_size);
    assert_eq!(back.kernel_base_address, info.kernel_base_address);
}
