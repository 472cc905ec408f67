//! End-to-end acquisition scenarios against the simulated backend.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use picodaq::{
    AcquisitionMode, Conf, DaqError, DigitizerBlock, Driver, OutputSlot, SharedDriver, SimConfig,
    SimScope, Tag, TriggerDirection, Waveform, WorkOutput, WorkResult,
};

fn sim_block(
    ai_channels: usize,
    di_ports: usize,
    cfg: SimConfig,
) -> (DigitizerBlock, Arc<Mutex<SimScope>>) {
    let sim = Arc::new(Mutex::new(SimScope::new(cfg)));
    let driver: SharedDriver = sim.clone();
    let block = DigitizerBlock::new(driver, ai_channels, di_ports, false);
    (block, sim)
}

#[test]
fn streaming_happy_path() {
    let (mut block, sim) = sim_block(2, 0, SimConfig::default());
    block.set_aichan("A", true, 5.0, true, 0.0).unwrap();
    block.set_aichan("B", true, 5.0, true, 0.0).unwrap();
    block.set_samp_rate(1_000_000.0).unwrap();
    block.set_streaming(0.001).unwrap();
    block.set_buffer_size(1024).unwrap();
    block.set_nr_buffers(8).unwrap();

    block.initialize().unwrap();
    block.configure().unwrap();
    block.arm().unwrap();

    let mut a_values = vec![0f32; 1024];
    let mut a_errors = vec![0f32; 1024];
    let mut b_values = vec![0f32; 1024];
    let mut b_errors = vec![0f32; 1024];

    for i in 0..32u64 {
        // One producer chunk, one consumed chunk, no poll thread involved.
        sim.lock().unwrap().poll().unwrap();

        let mut out = WorkOutput::new(vec![
            OutputSlot::Analog(&mut a_values),
            OutputSlot::Analog(&mut a_errors),
            OutputSlot::Analog(&mut b_values),
            OutputSlot::Analog(&mut b_errors),
        ]);
        assert_eq!(block.work(4096, &mut out), WorkResult::Produced(1024));

        let timebase_tags: Vec<_> = out
            .tags
            .iter()
            .filter(|t| matches!(t.tag, Tag::Timebase(_)))
            .collect();
        if i == 0 {
            // Republished once per start, on every slot.
            assert_eq!(timebase_tags.len(), 4);
            for tag in &timebase_tags {
                assert_eq!(tag.offset, 0);
                if let Tag::Timebase(timebase) = tag.tag {
                    assert!((timebase - 1e-6).abs() < 1e-12);
                }
            }
        } else {
            assert!(timebase_tags.is_empty());
        }

        let info_tags: Vec<_> = out
            .tags
            .iter()
            .filter(|t| matches!(t.tag, Tag::AcqInfo(_)))
            .collect();
        assert_eq!(info_tags.len(), 2);
        let mut info_slots: Vec<usize> = info_tags.iter().map(|t| t.slot).collect();
        info_slots.sort_unstable();
        assert_eq!(info_slots, vec![0, 2]);
        for tag in &info_tags {
            assert_eq!(tag.offset, i * 1024);
        }
    }

    assert_eq!(block.items_written(), 32 * 1024);
    assert!(block
        .errors()
        .iter()
        .all(|e| !matches!(e.error, DaqError::BufferOverflow { .. })));
}

#[test]
fn streaming_with_poll_thread() {
    let (mut block, _sim) = sim_block(1, 0, SimConfig::default());
    block.set_aichan("A", true, 5.0, true, 0.0).unwrap();
    block.set_samp_rate(1_000_000.0).unwrap();
    block.set_streaming(0.001).unwrap();
    block.set_buffer_size(256).unwrap();
    block.set_auto_arm(true).unwrap();

    assert!(block.start());

    let mut values = vec![0f32; 256];
    let mut errors = vec![0f32; 256];
    for _ in 0..4 {
        let mut out = WorkOutput::new(vec![
            OutputSlot::Analog(&mut values),
            OutputSlot::Analog(&mut errors),
        ]);
        assert_eq!(block.work(256, &mut out), WorkResult::Produced(256));
    }

    assert!(block.stop());
}

#[test]
fn streaming_software_trigger_offsets() {
    // Square wave, period 512: rises at 0, 512, 1024, ... within the stream.
    let cfg = SimConfig {
        waveform: Waveform::Square { period: 512 },
        ..Default::default()
    };
    let (mut block, sim) = sim_block(1, 0, cfg);
    block.set_aichan("A", true, 5.0, true, 0.0).unwrap();
    block.set_samp_rate(1_000_000.0).unwrap();
    block.set_streaming(0.001).unwrap();
    block.set_buffer_size(1024).unwrap();
    block
        .set_aichan_trigger("A", TriggerDirection::Rising, 0.5)
        .unwrap();

    block.initialize().unwrap();
    block.configure().unwrap();
    block.arm().unwrap();

    let mut values = vec![0f32; 1024];
    let mut errors = vec![0f32; 1024];
    let mut trigger_offsets = Vec::new();
    for _ in 0..2 {
        sim.lock().unwrap().poll().unwrap();
        let mut out = WorkOutput::new(vec![
            OutputSlot::Analog(&mut values),
            OutputSlot::Analog(&mut errors),
        ]);
        assert!(matches!(block.work(1024, &mut out), WorkResult::Produced(_)));
        trigger_offsets.extend(
            out.tags
                .iter()
                .filter(|t| t.tag == Tag::Trigger)
                .map(|t| t.offset),
        );
    }

    assert_eq!(trigger_offsets, vec![0, 512, 1024, 1536]);
}

#[test]
fn digital_trigger_on_port_bit() {
    // The simulated port bits follow the analog square wave, so bit 3
    // rises wherever the wave does.
    let cfg = SimConfig {
        waveform: Waveform::Square { period: 512 },
        ..Default::default()
    };
    let (mut block, sim) = sim_block(1, 1, cfg);
    block.set_aichan("A", true, 5.0, true, 0.0).unwrap();
    block.set_diport("port0", true, 1.5).unwrap();
    block.set_samp_rate(1_000_000.0).unwrap();
    block.set_streaming(0.001).unwrap();
    block.set_buffer_size(1024).unwrap();
    block.set_di_trigger(3, TriggerDirection::Rising).unwrap();

    block.initialize().unwrap();
    block.configure().unwrap();
    block.arm().unwrap();

    sim.lock().unwrap().poll().unwrap();

    let mut values = vec![0f32; 1024];
    let mut errors = vec![0f32; 1024];
    let mut bits = vec![0u8; 1024];
    let mut out = WorkOutput::new(vec![
        OutputSlot::Analog(&mut values),
        OutputSlot::Analog(&mut errors),
        OutputSlot::Digital(&mut bits),
    ]);
    assert_eq!(block.work(1024, &mut out), WorkResult::Produced(1024));

    // Trigger tags land on every enabled output: the channel values
    // slot and the port slot.
    let mut by_slot: Vec<(usize, u64)> = out
        .tags
        .iter()
        .filter(|t| t.tag == Tag::Trigger)
        .map(|t| (t.slot, t.offset))
        .collect();
    by_slot.sort_unstable();
    assert_eq!(by_slot, vec![(0, 0), (0, 512), (2, 0), (2, 512)]);
}

#[test]
fn rapid_block_three_captures_then_done() {
    let (mut block, _sim) = sim_block(1, 0, SimConfig::default());
    block.set_aichan("A", true, 5.0, true, 0.0).unwrap();
    block.set_samp_rate(1_000_000.0).unwrap();
    block.set_rapid_block(3).unwrap();
    block.set_samples(900, 100).unwrap();
    block
        .set_aichan_trigger("A", TriggerDirection::Rising, 0.5)
        .unwrap();
    block.set_trigger_once(true).unwrap();
    block.set_auto_arm(true).unwrap();

    block.initialize().unwrap();
    block.configure().unwrap();

    let mut values = vec![0f32; 1000];
    let mut errors = vec![0f32; 1000];

    for waveform in 0..3u64 {
        let mut out = WorkOutput::new(vec![
            OutputSlot::Analog(&mut values),
            OutputSlot::Analog(&mut errors),
        ]);
        assert_eq!(block.work(1000, &mut out), WorkResult::Produced(1000));

        let block_start = waveform * 1000;

        // One marker tag at the trigger position within the block.
        let markers: Vec<_> = out
            .tags
            .iter()
            .filter(|t| t.tag == Tag::Trigger && t.slot == 0)
            .collect();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].offset, block_start + 100);

        // And one metadata tag at the block start.
        let infos: Vec<_> = out
            .tags
            .iter()
            .filter(|t| matches!(t.tag, Tag::TriggerInfo(_)) && t.slot == 0)
            .collect();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].offset, block_start);
        if let Tag::TriggerInfo(info) = &infos[0].tag {
            assert_eq!(info.pre_samples, 100);
            assert_eq!(info.post_samples, 900);
        }
    }

    // trigger_once: the fourth call ends the stream.
    let mut out = WorkOutput::new(vec![
        OutputSlot::Analog(&mut values),
        OutputSlot::Analog(&mut errors),
    ]);
    assert_eq!(block.work(1000, &mut out), WorkResult::Done);
    assert!(out.tags.is_empty());
}

#[test]
fn rapid_block_partial_reads() {
    let (mut block, _sim) = sim_block(1, 0, SimConfig::default());
    block.set_aichan("A", true, 5.0, true, 0.0).unwrap();
    block.set_rapid_block(1).unwrap();
    block.set_samples(900, 100).unwrap();
    block.set_trigger_once(true).unwrap();
    block.set_auto_arm(true).unwrap();

    block.initialize().unwrap();
    block.configure().unwrap();

    let mut values = vec![0f32; 256];
    let mut errors = vec![0f32; 256];

    // 1000 samples arrive as 256 + 256 + 256 + 232.
    let mut produced = 0;
    let mut calls = 0;
    while produced < 1000 {
        let mut out = WorkOutput::new(vec![
            OutputSlot::Analog(&mut values),
            OutputSlot::Analog(&mut errors),
        ]);
        match block.work(256, &mut out) {
            WorkResult::Produced(n) => {
                assert!(n <= 256);
                produced += n;
            }
            other => panic!("unexpected result {other:?}"),
        }
        calls += 1;
    }
    assert_eq!(produced, 1000);
    assert_eq!(calls, 4);

    let mut out = WorkOutput::new(vec![
        OutputSlot::Analog(&mut values),
        OutputSlot::Analog(&mut errors),
    ]);
    assert_eq!(block.work(256, &mut out), WorkResult::Done);
}

#[test]
fn stop_interrupts_blocked_work() {
    let (mut block, _sim) = sim_block(1, 0, SimConfig::default());
    block.set_aichan("A", true, 5.0, true, 0.0).unwrap();
    block.set_streaming(0.001).unwrap();
    block.set_buffer_size(64).unwrap();

    block.initialize().unwrap();
    block.configure().unwrap();
    block.arm().unwrap();

    let stop = block.stop_handle();
    let worker = thread::spawn(move || {
        let mut values = vec![0f32; 64];
        let mut errors = vec![0f32; 64];
        let mut out = WorkOutput::new(vec![
            OutputSlot::Analog(&mut values),
            OutputSlot::Analog(&mut errors),
        ]);
        // No producer is running: this blocks until stop is requested.
        let result = block.work(64, &mut out);
        (result, out.tags.len())
    });

    thread::sleep(Duration::from_millis(50));
    stop.request_stop();

    let (result, tag_count) = worker.join().unwrap();
    assert_eq!(result, WorkResult::Done);
    assert_eq!(tag_count, 0);
}

#[test]
fn buffer_overflow_is_reported_not_fatal() {
    let (mut block, sim) = sim_block(1, 0, SimConfig::default());
    block.set_aichan("A", true, 5.0, true, 0.0).unwrap();
    block.set_streaming(0.001).unwrap();
    block.set_buffer_size(64).unwrap();
    block.set_nr_buffers(4).unwrap();

    block.initialize().unwrap();
    block.configure().unwrap();
    block.arm().unwrap();

    // Six chunks into a four-deep ring: the two oldest are overwritten.
    for _ in 0..6 {
        sim.lock().unwrap().poll().unwrap();
    }

    let mut values = vec![0f32; 64];
    let mut errors = vec![0f32; 64];
    for i in 0..4 {
        let mut out = WorkOutput::new(vec![
            OutputSlot::Analog(&mut values),
            OutputSlot::Analog(&mut errors),
        ]);
        assert_eq!(block.work(64, &mut out), WorkResult::Produced(64));
        if i == 0 {
            assert!(block
                .errors()
                .iter()
                .any(|e| e.error == DaqError::BufferOverflow { lost: 2 }));
        }
    }

    // Only the first dequeue saw losses.
    let overflows = block
        .errors()
        .iter()
        .filter(|e| matches!(e.error, DaqError::BufferOverflow { .. }))
        .count();
    assert_eq!(overflows, 1);
}

#[test]
fn config_file_applies_to_block() {
    let toml = r#"
[acquisition]
sample_rate = 2000000.0
mode = "rapid_block"
samples = 800
pre_samples = 200
nr_captures = 5
trigger_once = true

[trigger]
source = "b"
threshold = 0.25
direction = "falling"

[channels.a]
enabled = true
range = 5.0

[channels.b]
enabled = true
range = 0.5
offset = 0.1
coupling = "dc_50"

[ports.port0]
enabled = true
logic_level = 1.8
"#;

    let path = std::env::temp_dir().join(format!(
        "picodaq-conf-{}-{}.toml",
        std::process::id(),
        picodaq::timestamp_utc_ns()
    ));
    std::fs::write(&path, toml).unwrap();

    let conf = Conf::load(&path).unwrap();
    let (mut block, _sim) = sim_block(4, 1, SimConfig::default());
    conf.apply(&mut block).unwrap();
    std::fs::remove_file(&path).ok();

    assert_eq!(block.acquisition_mode(), AcquisitionMode::RapidBlock);
    assert_eq!(block.settings().sample_rate, 2_000_000.0);
    assert_eq!(block.settings().nr_captures, 5);
    assert_eq!(block.settings().samples, 800);
    assert_eq!(block.settings().pre_samples, 200);
    assert!(block.settings().trigger_once);
    assert_eq!(block.enabled_aichan_count(), 2);
    assert_eq!(block.enabled_diport_count(), 1);
}

#[test]
fn stream_offset_continues_across_rearm() {
    let (mut block, sim) = sim_block(1, 0, SimConfig::default());
    block.set_aichan("A", true, 5.0, true, 0.0).unwrap();
    block.set_streaming(0.001).unwrap();
    block.set_buffer_size(128).unwrap();

    block.initialize().unwrap();
    block.configure().unwrap();
    block.arm().unwrap();

    let mut values = vec![0f32; 128];
    let mut errors = vec![0f32; 128];

    sim.lock().unwrap().poll().unwrap();
    let mut out = WorkOutput::new(vec![
        OutputSlot::Analog(&mut values),
        OutputSlot::Analog(&mut errors),
    ]);
    assert_eq!(block.work(128, &mut out), WorkResult::Produced(128));
    assert_eq!(block.items_written(), 128);

    block.disarm();
    block.arm().unwrap();

    sim.lock().unwrap().poll().unwrap();
    let mut out = WorkOutput::new(vec![
        OutputSlot::Analog(&mut values),
        OutputSlot::Analog(&mut errors),
    ]);
    assert_eq!(block.work(128, &mut out), WorkResult::Produced(128));

    // The stream offset is a property of the downstream stream; it is
    // not reset by a rearm. The timebase tag is republished though.
    assert_eq!(block.items_written(), 256);
    let timebase_tags = out
        .tags
        .iter()
        .filter(|t| matches!(t.tag, Tag::Timebase(_)))
        .count();
    assert_eq!(timebase_tags, 2);
}
