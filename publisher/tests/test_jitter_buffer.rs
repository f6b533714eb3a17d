//! Integration tests for the publisher jitter buffer.
//!
//! Drives the synchronous core with an injected clock: packets and timer
//! ticks are interleaved the way the pipeline task would interleave them.

mod network_simulator;

use network_simulator::{NetworkSimulator, NetworkSimulatorConfig};
use publisher::{JitterBuffer, JitterBufferConfig, JitterOutput, State};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use sfu_common::rtcp::RtcpPacket;
use sfu_common::{RtpPacket, SessionConfig, VideoCodec};
use std::time::{Duration, Instant};

const SSRC: u32 = 0x00C0_FFEE;
const PT: u8 = 96;
const RTX_SSRC: u32 = 0x00C0_FFEF;
const RTX_PT: u8 = 97;
const AUDIO_SSRC: u32 = 0x0000_A0D1;
const AUDIO_PT: u8 = 111;

/// 90 kHz ticks per 20 ms frame
const TS_STEP: u32 = 1800;

const TICK: Duration = Duration::from_millis(5);

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn new_buffer(t0: Instant) -> JitterBuffer {
    // ---
    let session = SessionConfig::default();
    JitterBuffer::new(
        JitterBufferConfig::video(&session, VideoCodec::H264, PT, SSRC),
        t0,
    )
}

fn new_rtx_buffer(t0: Instant) -> JitterBuffer {
    // ---
    let session = SessionConfig::default();
    JitterBuffer::new(
        JitterBufferConfig::video(&session, VideoCodec::H264, PT, SSRC).with_rtx(RTX_PT, RTX_SSRC),
        t0,
    )
}

/// One-packet frame. A STAP-A NAL marks a key frame.
fn frame(seq: u16, key: bool) -> RtpPacket {
    // ---
    let nal = if key { 0x78 } else { 0x41 };
    RtpPacket::new(PT, seq, seq as u32 * TS_STEP, SSRC, true, &[nal, 0xAB, 0xCD])
}

/// Everything observed on the buffer outputs, with the time it appeared.
#[derive(Default)]
struct Observed {
    rtp: Vec<u16>,
    nacks: Vec<(Duration, Vec<u16>)>,
    plis: Vec<Duration>,
}

impl Observed {
    fn collect(&mut self, jb: &mut JitterBuffer, elapsed: Duration) {
        // ---
        while let Some(output) = jb.poll_output() {
            match output {
                JitterOutput::Rtp(p) => self.rtp.push(p.sequence()),
                JitterOutput::Rtcp(RtcpPacket::Nack(n)) => self.nacks.push((elapsed, n.sequences())),
                JitterOutput::Rtcp(RtcpPacket::Pli(_)) => self.plis.push(elapsed),
                _ => {}
            }
        }
    }
}

/// Feeds `arrivals` (offset from t0) and ticks every [`TICK`] until `end`.
fn run(jb: &mut JitterBuffer, t0: Instant, arrivals: &[(u64, RtpPacket)], end: u64) -> Observed {
    // ---
    let mut observed = Observed::default();
    let mut elapsed = Duration::ZERO;

    while elapsed <= ms(end) {
        let now = t0 + elapsed;
        for (_, p) in arrivals.iter().filter(|(at, _)| ms(*at) == elapsed) {
            jb.on_packet(p.clone().with_created_at(now), now);
        }
        jb.on_tick(now);
        observed.collect(jb, elapsed);
        elapsed += TICK;
    }
    observed
}

/// Sequences 12 and 13 swapped: output is sorted, 12 is NACKed exactly
/// once while missing and no PLI is needed.
#[test]
fn test_swapped_packets_are_sorted_with_one_nack() {
    // ---
    let t0 = Instant::now();
    let mut jb = new_buffer(t0);

    let arrivals = vec![
        (0, frame(10, true)),
        (20, frame(11, false)),
        (40, frame(13, false)),
        (170, frame(12, false)),
        (175, frame(14, false)),
    ];
    let observed = run(&mut jb, t0, &arrivals, 250);

    assert_eq!(observed.rtp, vec![10, 11, 12, 13, 14]);
    assert_eq!(observed.nacks.len(), 1);
    assert_eq!(observed.nacks[0].1, vec![12]);
    assert!(observed.plis.is_empty());
    assert_eq!(jb.state(), State::Streaming);
}

/// Any arrival order of a burst behind the key frame is emitted sorted.
#[test]
fn test_permutation_is_emitted_in_order() {
    // ---
    const N: u16 = 50;

    for seed in [1u64, 7, 42, 1234] {
        let t0 = Instant::now();
        let mut jb = new_buffer(t0);
        let mut rng = StdRng::seed_from_u64(seed);

        let mut order: Vec<u16> = (1..N).collect();
        order.shuffle(&mut rng);

        let mut arrivals = vec![(0, frame(0, true))];
        arrivals.extend(
            order
                .into_iter()
                .enumerate()
                .map(|(i, seq)| (i as u64 + 1, frame(seq, false))),
        );

        let mut observed = Observed::default();
        for (at, p) in arrivals {
            let now = t0 + ms(at);
            jb.on_packet(p.with_created_at(now), now);
            jb.on_tick(now);
            observed.collect(&mut jb, ms(at));
        }

        assert_eq!(observed.rtp, (0..N).collect::<Vec<_>>(), "seed {seed}");
        assert!(observed.plis.is_empty(), "seed {seed}");
    }
}

/// A packet withheld forever gets exactly five NACKs, then PLIs every
/// two seconds until a key frame restarts the stream.
#[test]
fn test_withheld_packet_escalates_to_pli() {
    // ---
    let t0 = Instant::now();
    let mut jb = new_buffer(t0);

    let mut arrivals: Vec<(u64, RtpPacket)> = (100u16..=110)
        .filter(|seq| *seq != 105)
        .map(|seq| ((seq as u64 - 100) * 20, frame(seq, seq == 100)))
        .collect();
    arrivals.push((5000, frame(300, true)));
    arrivals.push((5020, frame(301, false)));

    let observed = run(&mut jb, t0, &arrivals, 9000);

    assert_eq!(observed.nacks.len(), 5);
    assert!(observed.nacks.iter().all(|(_, seqs)| seqs == &vec![105]));

    // NACKs are spaced by at least one packet interval
    for pair in observed.nacks.windows(2) {
        assert!(pair[1].0 - pair[0].0 >= ms(20));
    }

    let first_pli = observed.plis[0];
    assert!(first_pli > observed.nacks[4].0);
    assert_eq!(
        observed.plis,
        vec![first_pli, first_pli + ms(2000), first_pli + ms(4000)]
    );

    // 100..104 before the loss, then the restart
    assert_eq!(observed.rtp, vec![100, 101, 102, 103, 104, 300, 301]);
    assert_eq!(jb.state(), State::Streaming);
    assert_eq!(jb.packet_loss(), 1);
}

/// Jitter and reordering below the NACK threshold never trigger
/// recovery.
#[test]
fn test_jittered_stream_needs_no_recovery() {
    // ---
    let t0 = Instant::now();
    let mut jb = new_buffer(t0);
    let mut sim = NetworkSimulator::new(NetworkSimulatorConfig {
        jitter_ms: 40,
        reorder_rate: 0.2,
        seed: 7,
        ..Default::default()
    });

    jb.on_packet(frame(0, true).with_created_at(t0), t0);
    let mut observed = Observed::default();
    observed.collect(&mut jb, Duration::ZERO);

    let mut elapsed = Duration::ZERO;
    let mut next_seq = 1u16;
    while elapsed <= ms(3000) {
        let now = t0 + elapsed;
        if elapsed.as_millis() % 20 == 0 && next_seq < 100 {
            sim.send(frame(next_seq, false), now);
            next_seq += 1;
        }
        while let Some(p) = sim.receive(now) {
            jb.on_packet(p, now);
        }
        jb.on_tick(now);
        observed.collect(&mut jb, elapsed);
        elapsed += TICK;
    }

    assert_eq!(sim.in_flight(), 0);
    assert_eq!(observed.rtp, (0..100).collect::<Vec<_>>());
    assert!(observed.nacks.is_empty());
    assert!(observed.plis.is_empty());
}

/// Random loss may stall the stream, but what comes out is always in
/// strictly increasing order.
#[test]
fn test_lossy_stream_output_stays_ordered() {
    // ---
    let t0 = Instant::now();
    let mut jb = new_buffer(t0);
    let mut sim = NetworkSimulator::new(NetworkSimulatorConfig {
        loss_rate: 0.05,
        jitter_ms: 30,
        reorder_rate: 0.1,
        seed: 99,
    });

    let mut observed = Observed::default();
    let mut elapsed = Duration::ZERO;
    let mut seq = 0u16;
    while elapsed <= ms(10_000) {
        let now = t0 + elapsed;
        if elapsed.as_millis() % 20 == 0 {
            // a key frame every second
            sim.send(frame(seq, seq % 50 == 0), now);
            seq += 1;
        }
        while let Some(p) = sim.receive(now) {
            jb.on_packet(p, now);
        }
        jb.on_tick(now);
        observed.collect(&mut jb, elapsed);
        elapsed += TICK;
    }

    assert!(sim.packets_lost() > 0);
    assert!(!observed.rtp.is_empty());
    assert!(observed.rtp.windows(2).all(|w| w[0] < w[1]));
    assert!(!observed.nacks.is_empty());
}

/// RTX padding sent as a bandwidth probe: no OSN, no payload.
fn padding_probe(rtx_seq: u16) -> RtpPacket {
    // ---
    let mut data = RtpPacket::new(RTX_PT, rtx_seq, 0, RTX_SSRC, false, &[]).into_data();
    data[0] |= 0x20;
    data.extend_from_slice(&[0, 0, 0, 4]);
    RtpPacket::parse(data, Instant::now()).unwrap()
}

/// Sequence 12 is recovered through RTX: it is unwrapped, fills the gap
/// and the stream goes on without a PLI. A second RTX copy arriving after
/// the gap closed is ignored.
#[test]
fn test_rtx_packet_fills_the_gap() {
    // ---
    let t0 = Instant::now();
    let mut jb = new_rtx_buffer(t0);

    let arrivals = vec![
        (0, frame(10, true)),
        (20, frame(11, false)),
        (40, frame(13, false)),
        (60, padding_probe(1)),
        (170, frame(12, false).to_rtx(RTX_PT, 2, RTX_SSRC)),
        (175, frame(14, false)),
        (200, frame(12, false).to_rtx(RTX_PT, 3, RTX_SSRC)),
    ];
    let observed = run(&mut jb, t0, &arrivals, 250);

    assert_eq!(observed.rtp, vec![10, 11, 12, 13, 14]);
    assert_eq!(observed.nacks.len(), 1);
    assert_eq!(observed.nacks[0].1, vec![12]);
    assert!(observed.plis.is_empty());
    assert_eq!(jb.state(), State::Streaming);
    assert_eq!(jb.packet_loss(), 0);
}

/// RTX arriving before the stream is streaming is dropped, even when it
/// carries a key frame.
#[test]
fn test_rtx_is_dropped_while_waiting_for_key_frame() {
    // ---
    let t0 = Instant::now();
    let mut jb = new_rtx_buffer(t0);

    let arrivals = vec![
        (0, frame(10, true).to_rtx(RTX_PT, 1, RTX_SSRC)),
        (20, frame(11, false).to_rtx(RTX_PT, 2, RTX_SSRC)),
    ];
    let observed = run(&mut jb, t0, &arrivals, 100);

    assert!(observed.rtp.is_empty());
    assert_eq!(jb.state(), State::WaitingKeyFrame);

    // the regular key frame starts the stream afterwards
    let now = t0 + ms(120);
    jb.on_packet(frame(12, true).with_created_at(now), now);
    let mut observed = Observed::default();
    observed.collect(&mut jb, ms(120));
    assert_eq!(observed.rtp, vec![12]);
    assert_eq!(jb.state(), State::Streaming);
}

/// Audio never NACKs: once nothing progressed for 50 ms the waiting
/// packets are released with a hole where sequence 3 was.
#[test]
fn test_stalled_audio_is_flushed_with_a_hole() {
    // ---
    let t0 = Instant::now();
    let session = SessionConfig::default();
    let mut jb = JitterBuffer::new(JitterBufferConfig::audio(&session, AUDIO_PT, AUDIO_SSRC), t0);

    let audio = |seq: u16, at: u64| {
        let now = t0 + ms(at);
        let p = RtpPacket::new(AUDIO_PT, seq, seq as u32 * 960, AUDIO_SSRC, false, &[0xFC, seq as u8]);
        (p.with_created_at(now), now)
    };
    let mut observed = Observed::default();

    for (seq, at) in [(1, 0), (2, 20), (4, 40)] {
        let (p, now) = audio(seq, at);
        jb.on_packet(p, now);
        jb.on_tick(now);
        observed.collect(&mut jb, ms(at));
    }
    // 20 ms after the last progress: 4 still waits for 3
    assert_eq!(observed.rtp, vec![1, 2]);

    for (seq, at) in [(5, 100), (6, 120)] {
        let (p, now) = audio(seq, at);
        jb.on_packet(p, now);
        jb.on_tick(now);
        observed.collect(&mut jb, ms(at));
    }

    assert_eq!(observed.rtp, vec![1, 2, 4, 5, 6]);
    assert!(observed.nacks.is_empty());
    assert!(observed.plis.is_empty());
}
