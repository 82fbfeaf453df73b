mod common;

use common::{connect, connect_with, test_config};
use smartwave::protocol::Opcode;
use smartwave::update::{BITSTREAM_LEN, FIRMWARE_LEN};
use smartwave::{Bitstream, CloseReason, Error, FirmwareImage, UpdateProgress, UpdateState};

fn firmware() -> FirmwareImage {
    let raw: Vec<u8> = (0..FIRMWARE_LEN).map(|i| i as u8).collect();
    FirmwareImage::from_bytes(&raw).unwrap()
}

#[tokio::test]
async fn firmware_update_reports_progress_to_completion() {
    let (connection, sim) = connect().await;
    let image = firmware();
    let mark = sim.mark();

    let mut progress: Vec<UpdateProgress> = Vec::new();
    connection
        .update_firmware(&image, |p| progress.push(p))
        .await
        .unwrap();

    let chunks = FIRMWARE_LEN.div_ceil(4096);
    let states: Vec<UpdateState> = progress.iter().map(|p| p.state).collect();
    assert_eq!(states.len(), chunks + 3);
    assert_eq!(states[0], UpdateState::BootloaderEntry);
    assert_eq!(progress[0].sent, 0);
    assert!(states[1..=chunks]
        .iter()
        .all(|&s| s == UpdateState::Transferring));
    assert_eq!(states[chunks + 1], UpdateState::Verifying);
    assert!(progress.windows(2).all(|w| w[0].sent <= w[1].sent));
    let last = progress.last().unwrap();
    assert_eq!(last.state, UpdateState::Complete);
    assert_eq!(last.sent, FIRMWARE_LEN);
    assert_eq!(last.percent(), 100);

    let sent = sim.since(mark);
    assert!(sent.iter().all(|f| f.opcode == Opcode::FirmwareUpdate));
    assert_eq!(sent.len(), chunks + 2);
    let start = &sent[0].payload;
    assert_eq!(start[0], 0x1B);
    assert_eq!(&start[1..5], &(FIRMWARE_LEN as u32).to_be_bytes());
    assert_eq!(&start[5..9], &image.checksum().to_be_bytes());
    // second chunk starts at offset 4096
    assert_eq!(&sent[2].payload[..5], &[0x01, 0x00, 0x00, 0x10, 0x00]);
    assert_eq!(&sent[chunks + 1].payload[..], &[0x02]);
    assert!(connection.is_connected());
}

#[tokio::test]
async fn corrupt_chunk_fails_the_update_and_closes_the_session() {
    let (connection, _sim) = connect_with(test_config(), |s| {
        s.corrupt_chunk = Some(2);
    })
    .await;

    // (progress, connected when reported)
    let mut progress: Vec<(UpdateProgress, bool)> = Vec::new();
    let observer = connection.clone();
    let result = connection
        .update_firmware(&firmware(), |p| progress.push((p, observer.is_connected())))
        .await;

    assert!(matches!(result, Err(Error::UpdateFailed(_))));
    let states: Vec<UpdateState> = progress.iter().map(|(p, _)| p.state).collect();
    // Only the two acknowledged chunks were reported.
    assert_eq!(
        states,
        vec![
            UpdateState::BootloaderEntry,
            UpdateState::Transferring,
            UpdateState::Transferring,
            UpdateState::Failed,
        ]
    );
    let (failed, connected) = progress[3];
    assert_eq!(failed.sent, 8192);
    assert!(connected, "Failed is reported before the session closes");

    assert!(!connection.is_connected());
    assert!(matches!(
        connection.close_reason(),
        Some(CloseReason::UpdateFailed(_))
    ));
    assert!(matches!(
        connection.trigger().await,
        Err(Error::ConnectionLost(_))
    ));
}

#[tokio::test]
async fn silent_bootloader_fails_the_update() {
    let (connection, _sim) = connect_with(test_config(), |s| {
        s.silent.insert(Opcode::FirmwareUpdate);
    })
    .await;

    let mut states = Vec::new();
    let result = connection
        .update_firmware(&firmware(), |p| states.push(p.state))
        .await;
    assert!(matches!(result, Err(Error::UpdateFailed(_))));
    assert_eq!(states, vec![UpdateState::BootloaderEntry, UpdateState::Failed]);
    assert!(!connection.is_connected());
}

#[tokio::test]
async fn bitstream_update_sends_the_clock_divider() {
    let (connection, sim) = connect().await;
    let bitstream = Bitstream::from_bytes(&vec![0x5A; BITSTREAM_LEN])
        .unwrap()
        .with_clock_divider(4);
    let mark = sim.mark();

    let mut states = Vec::new();
    connection
        .update_bitstream(&bitstream, |p| states.push(p.state))
        .await
        .unwrap();
    assert_eq!(states.first(), Some(&UpdateState::BootloaderEntry));
    assert_eq!(states[states.len() - 2], UpdateState::Verifying);
    assert_eq!(states.last(), Some(&UpdateState::Complete));

    let sent = sim.since(mark);
    assert!(sent.iter().all(|f| f.opcode == Opcode::FpgaUpdate));
    assert_eq!(sent[0].payload[0], 0x1C);
    assert_eq!(&sent[1].payload[..], &[0x03, 0x00, 0x04]);
    assert_eq!(sent[2].payload[0], 0x01);
}
