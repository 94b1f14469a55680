use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;

use commwatch::adapter::{Adapter, Handle, adapter_for};
use commwatch::codec::ProtocolCodec;
use commwatch::device::DeviceType;
use commwatch::event::EventKind;
use commwatch::export;
use commwatch::frame::Direction;
use commwatch::session::Session;
use commwatch::simulator::SimulatorConfig;

#[test]
fn e2e_loopback_uart_session() -> Result<()> {
    let mut session = Session::new();
    let received = Arc::new(AtomicUsize::new(0));
    let r = received.clone();
    session
        .bus()
        .subscribe(EventKind::FrameReceived, Box::new(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        }));
    session.connect_simulator(DeviceType::Uart, &SimulatorConfig::loopback())?;

    let registry = commwatch::codec::CodecRegistry::with_defaults();
    let efuse = registry.get("efuse").unwrap();
    let frame = efuse.encode(&[
        commwatch::frame::FrameField::new("type", commwatch::frame::FieldValue::U8(1)),
        commwatch::frame::FrameField::new(
            "payload",
            commwatch::frame::FieldValue::Bytes(vec![0x08, 0x00]),
        ),
    ])?;
    for _ in 0..3 {
        session.send(&frame)?;
    }
    std::thread::sleep(Duration::from_millis(200));
    session.disconnect()?;

    assert_eq!(received.load(Ordering::SeqCst), 3);
    let frames = session.frames();
    assert_eq!(frames.len(), 6);
    let rx: Vec<_> = frames
        .iter()
        .filter(|f| f.direction == Direction::Rx)
        .collect();
    assert_eq!(rx.len(), 3);
    for f in rx {
        assert_eq!(f.raw, frame);
        let decoded = f.decoded.as_ref().unwrap();
        assert_eq!(
            decoded.field("voltage").unwrap().value.as_str(),
            Some("1.650")
        );
        assert!(decoded.checksum.as_ref().unwrap().valid);
    }
    Ok(())
}

#[test]
fn e2e_burst_simulator_throughput() -> Result<()> {
    // burstInterval 100ms, burstSize 1: at least 5 frames after 550ms,
    // each a valid EFuse ADC frame.
    let mut session = Session::new();
    session.connect_simulator(DeviceType::Uart, &SimulatorConfig::burst(100, 1))?;
    std::thread::sleep(Duration::from_millis(550));
    session.disconnect()?;
    let frames = session.frames();
    assert!(frames.len() >= 5, "only {} frames", frames.len());
    for f in &frames {
        let decoded = f.decoded.as_ref().expect("burst frames must decode");
        assert_eq!(decoded.protocol, "efuse");
        assert!(decoded.field("adc_raw").is_some());
        assert!(decoded.checksum.as_ref().unwrap().valid);
        assert!(f.error.is_none());
    }
    Ok(())
}

#[test]
fn e2e_can_burst_traffic() -> Result<()> {
    let mut session = Session::with_protocol("hex")?;
    session.connect_simulator(DeviceType::Can, &SimulatorConfig::burst(30, 1))?;
    std::thread::sleep(Duration::from_millis(200));
    session.disconnect()?;
    let frames = session.frames();
    assert!(frames.len() >= 3, "only {} frames", frames.len());
    let ids: Vec<u32> = frames
        .iter()
        .map(|f| commwatch::can::parse_frame(&f.raw).unwrap().id)
        .collect();
    assert!(ids.contains(&0x100));
    assert!(ids.contains(&0x200));
    Ok(())
}

#[test]
fn e2e_export_and_replay_parse() -> Result<()> {
    let mut session = Session::new();
    session.connect_simulator(DeviceType::Uart, &SimulatorConfig::loopback())?;
    session.send(&[0xAB, 0xCD])?;
    std::thread::sleep(Duration::from_millis(80));
    session.disconnect()?;

    let tmp = tempfile::tempdir()?;
    let json_path = tmp.path().join("session.json");
    let csv_path = tmp.path().join("session.csv");
    std::fs::write(&json_path, session.export_json()?)?;
    std::fs::write(&csv_path, session.export_csv())?;

    let replay = export::from_json(&std::fs::read_to_string(&json_path)?)?;
    assert_eq!(replay.frames.len(), 2);
    let tx: Vec<_> = replay
        .frames
        .iter()
        .filter(|f| f.direction == Direction::Tx)
        .collect();
    assert_eq!(tx.len(), 1);
    assert_eq!(tx[0].raw, vec![0xAB, 0xCD]);

    let csv = std::fs::read_to_string(&csv_path)?;
    let mut lines = csv.lines();
    assert_eq!(lines.next(), Some("Timestamp,Direction,Length,Hex"));
    assert!(lines.next().unwrap().contains(",tx,2,\"ab cd\""));
    Ok(())
}

#[test]
fn e2e_every_adapter_has_a_simulator() -> Result<()> {
    for ty in [
        DeviceType::Uart,
        DeviceType::Spi,
        DeviceType::I2c,
        DeviceType::Can,
        DeviceType::Ethernet,
    ] {
        let adapter = adapter_for(ty);
        assert_eq!(adapter.device_type(), ty);
        assert!(adapter.supports_simulation());
        let devices = adapter.list_devices()?;
        assert!(!devices.is_empty(), "{ty}: no devices");
        let h = adapter.create_simulator(&SimulatorConfig::loopback())?;
        assert_eq!(h.device().device_type, ty);
        assert_eq!(h.stats().messages_rx, 0);
        h.close()?;
        // Close is idempotent, later calls fail cleanly.
        h.close()?;
        assert!(h.write(&[0, 0, 0, 1, 0]).is_err());
    }
    Ok(())
}

#[test]
fn e2e_scripted_timeline_feeds_session() -> Result<()> {
    use commwatch::simulator::{SimAction, SimulatorEvent, SimulatorScript};

    let script = SimulatorScript {
        events: vec![
            SimulatorEvent {
                delay_ms: 10,
                action: SimAction::Receive,
                data: Some(vec![0xAA, 0x02, 0x00, 0x01, 0x03]),
            },
            SimulatorEvent {
                delay_ms: 10,
                action: SimAction::Disconnect,
                data: None,
            },
        ],
        looping: false,
    };
    let mut session = Session::with_protocol("hex")?;
    session.connect_simulator(DeviceType::Uart, &SimulatorConfig::scripted(script))?;
    std::thread::sleep(Duration::from_millis(150));
    session.disconnect()?;
    let frames = session.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].raw, vec![0xAA, 0x02, 0x00, 0x01, 0x03]);
    Ok(())
}
