//! Vision node control loop.
//!
//! One object on the line must produce exactly one classification. The loop is
//! an explicit state machine:
//!
//! ```text
//! Scanning --best detection--> Classified --publish--> Cooldown --sleep--> Flush --discard N--> Scanning
//!     ^  |
//!     +--+ no detection above threshold / no frame
//! ```
//!
//! `Cooldown` is the only deliberate blocking point. `Flush` drops the frames
//! the camera buffered while the loop slept so the next scan sees the line as
//! it is now.

use anyhow::{Context, Result};
use std::fmt;
use std::time::Duration;

use crate::config::VisionSettings;
use crate::detect::{select_best, BestDetection, DetectorBackend};
use crate::ingest::FrameSource;
use crate::operator::OperatorSurface;
use crate::pacing::{Pacer, ThreadPacer};
use crate::transport::Publisher;

/// Current phase of the vision loop.
#[derive(Clone, Debug, PartialEq)]
pub enum VisionState {
    Scanning,
    /// A detection cleared the threshold and is waiting to be published.
    Classified(BestDetection),
    Cooldown,
    Flush,
}

impl fmt::Display for VisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scanning => write!(f, "scanning"),
            Self::Classified(best) => write!(f, "classified {}", best.label),
            Self::Cooldown => write!(f, "cooldown"),
            Self::Flush => write!(f, "flush"),
        }
    }
}

/// Result of one `VisionNode::step`. Fatal conditions are returned as `Err`
/// instead.
#[derive(Clone, Debug, PartialEq)]
pub enum StepOutcome {
    /// Frame scanned, nothing above the threshold.
    NoDetection { detections: usize },
    /// Frame scanned and a best detection chosen.
    Classified(BestDetection),
    Published { label: String },
    /// Handing the label to the transport failed. Not retried.
    PublishFailed { label: String, error: String },
    CooledDown(Duration),
    /// Stale frames read and dropped. `failed` reads count toward the total.
    Flushed { discarded: u32, failed: u32 },
    /// No frame this iteration.
    Skipped(String),
    /// Operator asked to stop.
    Quit,
}

impl StepOutcome {
    /// Iteration did not do its job but the loop keeps going.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Skipped(_) | Self::PublishFailed { .. })
    }
}

/// Counters reported when the loop ends.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VisionSummary {
    pub frames_scanned: u64,
    pub classifications: u64,
    pub published: u64,
    pub publish_failures: u64,
    pub frames_skipped: u64,
    pub frames_flushed: u64,
}

pub struct VisionNode {
    settings: VisionSettings,
    source: Box<dyn FrameSource>,
    detector: Box<dyn DetectorBackend>,
    publisher: Box<dyn Publisher>,
    pacer: Box<dyn Pacer>,
    state: VisionState,
    summary: VisionSummary,
    consecutive_skips: u64,
}

impl VisionNode {
    /// The source must already be connected.
    pub fn new(
        settings: VisionSettings,
        source: Box<dyn FrameSource>,
        detector: Box<dyn DetectorBackend>,
        publisher: Box<dyn Publisher>,
    ) -> Self {
        Self {
            settings,
            source,
            detector,
            publisher,
            pacer: Box::new(ThreadPacer),
            state: VisionState::Scanning,
            summary: VisionSummary::default(),
            consecutive_skips: 0,
        }
    }

    pub fn with_pacer(mut self, pacer: Box<dyn Pacer>) -> Self {
        self.pacer = pacer;
        self
    }

    pub fn state(&self) -> &VisionState {
        &self.state
    }

    pub fn summary(&self) -> &VisionSummary {
        &self.summary
    }

    /// Advance the state machine by one state.
    pub fn step(&mut self, operator: &mut dyn OperatorSurface) -> Result<StepOutcome> {
        match std::mem::replace(&mut self.state, VisionState::Scanning) {
            VisionState::Scanning => self.scan(operator),
            VisionState::Classified(best) => Ok(self.publish(best, operator)),
            VisionState::Cooldown => Ok(self.cool_down()),
            VisionState::Flush => Ok(self.flush()),
        }
    }

    /// Run until the operator quits or a fatal error occurs. The frame source
    /// is released when this returns.
    pub fn run(mut self, operator: &mut dyn OperatorSurface) -> Result<VisionSummary> {
        log::info!(
            "vision loop started (threshold {}, cooldown {:?}, flush {} frames)",
            self.settings.confidence_threshold,
            self.settings.cooldown,
            self.settings.flush_frames
        );
        loop {
            match self.step(operator) {
                Ok(StepOutcome::Quit) => break,
                Ok(_) => {}
                Err(err) => {
                    log::error!("vision loop stopped: {:#}", err);
                    return Err(err);
                }
            }
        }
        log::info!("vision loop stopped by operator: {:?}", self.summary);
        Ok(self.summary)
    }

    fn scan(&mut self, operator: &mut dyn OperatorSurface) -> Result<StepOutcome> {
        if operator.quit_requested()? {
            return Ok(StepOutcome::Quit);
        }

        let frame = match self.source.next_frame() {
            Ok(frame) => frame,
            Err(err) => {
                self.summary.frames_skipped += 1;
                self.consecutive_skips += 1;
                if self.consecutive_skips == 1 {
                    log::warn!("no frame from camera: {:#}", err);
                } else {
                    log::debug!("no frame from camera ({} in a row)", self.consecutive_skips);
                }
                return Ok(StepOutcome::Skipped(format!("{:#}", err)));
            }
        };
        if self.consecutive_skips > 1 {
            log::info!("camera recovered after {} missed frames", self.consecutive_skips);
        }
        self.consecutive_skips = 0;
        self.summary.frames_scanned += 1;

        operator.show(&frame)?;
        let result = frame
            .run_detector(self.detector.as_mut())
            .with_context(|| format!("detector '{}' failed", self.detector.name()))?;

        match select_best(&result.detections, self.settings.confidence_threshold) {
            Some(best) => {
                log::info!("detected {} ({:.2})", best.label, best.confidence);
                self.summary.classifications += 1;
                self.state = VisionState::Classified(best.clone());
                Ok(StepOutcome::Classified(best))
            }
            None => Ok(StepOutcome::NoDetection {
                detections: result.detections.len(),
            }),
        }
    }

    fn publish(&mut self, best: BestDetection, operator: &mut dyn OperatorSurface) -> StepOutcome {
        self.state = VisionState::Cooldown;
        let label = best.label;
        match self.publisher.publish(&label) {
            Ok(()) => {
                self.summary.published += 1;
                log::info!("published {}", label);
                operator.set_status(&format!("published {}", label));
                StepOutcome::Published { label }
            }
            Err(err) => {
                self.summary.publish_failures += 1;
                log::warn!("failed to publish {}: {:#}", label, err);
                operator.set_status(&format!("publish failed: {}", label));
                StepOutcome::PublishFailed {
                    label,
                    error: format!("{:#}", err),
                }
            }
        }
    }

    fn cool_down(&mut self) -> StepOutcome {
        let cooldown = self.settings.cooldown;
        log::debug!("cooling down for {:?}", cooldown);
        self.pacer.sleep(cooldown);
        self.state = VisionState::Flush;
        StepOutcome::CooledDown(cooldown)
    }

    fn flush(&mut self) -> StepOutcome {
        let mut failed = 0;
        for _ in 0..self.settings.flush_frames {
            if self.source.next_frame().is_err() {
                failed += 1;
            }
        }
        let discarded = self.settings.flush_frames;
        self.summary.frames_flushed += u64::from(discarded);
        log::debug!("flushed {} frame(s), {} read failure(s)", discarded, failed);
        self.state = VisionState::Scanning;
        StepOutcome::Flushed { discarded, failed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{Detection, DetectionResult};
    use crate::frame::Frame;
    use crate::pacing::ManualClock;
    use anyhow::anyhow;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    fn make_test_frame(sequence: u64) -> Frame {
        Frame::new(vec![0u8; 2 * 2 * 3], 2, 2, sequence).unwrap()
    }

    /// Yields frames until the script runs out; `false` entries fail.
    struct ScriptedSource {
        script: VecDeque<bool>,
        reads: Arc<Mutex<u64>>,
    }

    impl ScriptedSource {
        fn endless() -> Self {
            Self::scripted(Vec::new())
        }

        fn scripted(script: Vec<bool>) -> Self {
            Self {
                script: script.into(),
                reads: Arc::new(Mutex::new(0)),
            }
        }
    }

    impl FrameSource for ScriptedSource {
        fn connect(&mut self) -> Result<()> {
            Ok(())
        }

        fn next_frame(&mut self) -> Result<Frame> {
            let mut reads = self.reads.lock().unwrap();
            *reads += 1;
            match self.script.pop_front() {
                Some(false) => Err(anyhow!("camera returned no frame")),
                _ => Ok(make_test_frame(*reads)),
            }
        }
    }

    /// Reports `label` at `confidence` on every frame.
    struct FixedDetector {
        detections: Vec<Detection>,
    }

    impl FixedDetector {
        fn new(label: &str, confidence: f32) -> Self {
            Self {
                detections: vec![Detection::new(label, confidence)],
            }
        }
    }

    impl DetectorBackend for FixedDetector {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn detect(&mut self, _pixels: &[u8], _w: u32, _h: u32) -> Result<DetectionResult> {
            Ok(DetectionResult {
                detections: self.detections.clone(),
            })
        }
    }

    struct BrokenDetector;

    impl DetectorBackend for BrokenDetector {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn detect(&mut self, _pixels: &[u8], _w: u32, _h: u32) -> Result<DetectionResult> {
            Err(anyhow!("inference session lost"))
        }
    }

    /// Sees an object while the clock is before `until`.
    struct TimedDetector {
        clock: ManualClock,
        until: Duration,
    }

    impl DetectorBackend for TimedDetector {
        fn name(&self) -> &'static str {
            "timed"
        }

        fn detect(&mut self, _pixels: &[u8], _w: u32, _h: u32) -> Result<DetectionResult> {
            let detections = if self.clock.elapsed() < self.until {
                vec![Detection::new("ripe", 0.9)]
            } else {
                Vec::new()
            };
            Ok(DetectionResult { detections })
        }
    }

    /// Camera at a fixed frame interval on a manual clock.
    struct ClockedSource {
        clock: ManualClock,
        interval: Duration,
        sequence: u64,
    }

    impl FrameSource for ClockedSource {
        fn connect(&mut self) -> Result<()> {
            Ok(())
        }

        fn next_frame(&mut self) -> Result<Frame> {
            self.clock.advance(self.interval);
            self.sequence += 1;
            Ok(make_test_frame(self.sequence))
        }
    }

    #[derive(Clone, Default)]
    struct RecordingPublisher {
        clock: Option<ManualClock>,
        sent: Arc<Mutex<Vec<(String, Duration)>>>,
        fail: bool,
    }

    impl RecordingPublisher {
        fn labels(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|(l, _)| l.clone()).collect()
        }
    }

    impl Publisher for RecordingPublisher {
        fn publish(&mut self, label: &str) -> Result<()> {
            if self.fail {
                return Err(anyhow!("broker unreachable"));
            }
            let at = self.clock.as_ref().map(|c| c.elapsed()).unwrap_or_default();
            self.sent.lock().unwrap().push((label.to_string(), at));
            Ok(())
        }
    }

    /// Quits after `remaining` scanning checks.
    struct CountdownOperator {
        remaining: u32,
        shown: u32,
        statuses: Vec<String>,
    }

    impl CountdownOperator {
        fn new(scans: u32) -> Self {
            Self {
                remaining: scans,
                shown: 0,
                statuses: Vec::new(),
            }
        }
    }

    impl OperatorSurface for CountdownOperator {
        fn show(&mut self, _frame: &Frame) -> Result<()> {
            self.shown += 1;
            Ok(())
        }

        fn set_status(&mut self, status: &str) {
            self.statuses.push(status.to_string());
        }

        fn quit_requested(&mut self) -> Result<bool> {
            if self.remaining == 0 {
                return Ok(true);
            }
            self.remaining -= 1;
            Ok(false)
        }
    }

    fn settings(flush_frames: u32) -> VisionSettings {
        VisionSettings {
            confidence_threshold: 0.75,
            cooldown: Duration::from_secs(6),
            flush_frames,
        }
    }

    #[test]
    fn walks_the_full_cycle() {
        let publisher = RecordingPublisher::default();
        let clock = ManualClock::new();
        let mut node = VisionNode::new(
            settings(5),
            Box::new(ScriptedSource::endless()),
            Box::new(FixedDetector::new("ripe", 0.9)),
            Box::new(publisher.clone()),
        )
        .with_pacer(Box::new(clock.clone()));
        let mut operator = CountdownOperator::new(10);

        assert_eq!(node.state(), &VisionState::Scanning);
        let best = BestDetection {
            label: "ripe".to_string(),
            confidence: 0.9,
        };
        assert_eq!(
            node.step(&mut operator).unwrap(),
            StepOutcome::Classified(best.clone())
        );
        assert_eq!(node.state(), &VisionState::Classified(best));

        assert_eq!(
            node.step(&mut operator).unwrap(),
            StepOutcome::Published {
                label: "ripe".to_string()
            }
        );
        assert_eq!(node.state(), &VisionState::Cooldown);

        assert_eq!(
            node.step(&mut operator).unwrap(),
            StepOutcome::CooledDown(Duration::from_secs(6))
        );
        assert_eq!(clock.elapsed(), Duration::from_secs(6));
        assert_eq!(node.state(), &VisionState::Flush);

        assert_eq!(
            node.step(&mut operator).unwrap(),
            StepOutcome::Flushed {
                discarded: 5,
                failed: 0
            }
        );
        assert_eq!(node.state(), &VisionState::Scanning);
        assert_eq!(publisher.labels(), vec!["ripe"]);
        assert_eq!(operator.statuses, vec!["published ripe"]);
    }

    #[test]
    fn stays_scanning_below_threshold() {
        let publisher = RecordingPublisher::default();
        let mut node = VisionNode::new(
            settings(5),
            Box::new(ScriptedSource::endless()),
            Box::new(FixedDetector::new("ripe", 0.75)),
            Box::new(publisher.clone()),
        );
        let mut operator = CountdownOperator::new(10);

        for _ in 0..3 {
            assert_eq!(
                node.step(&mut operator).unwrap(),
                StepOutcome::NoDetection { detections: 1 }
            );
            assert_eq!(node.state(), &VisionState::Scanning);
        }
        assert!(publisher.labels().is_empty());
    }

    #[test]
    fn object_in_view_for_ten_frames_is_published_once() {
        let clock = ManualClock::new();
        let publisher = RecordingPublisher::default();
        let source = ClockedSource {
            clock: clock.clone(),
            interval: Duration::from_millis(100),
            sequence: 0,
        };
        // Ten frames at 100 ms: the object is gone after one second.
        let detector = TimedDetector {
            clock: clock.clone(),
            until: Duration::from_millis(1001),
        };
        let node = VisionNode::new(
            settings(5),
            Box::new(source),
            Box::new(detector),
            Box::new(publisher.clone()),
        )
        .with_pacer(Box::new(clock.clone()));

        let mut operator = CountdownOperator::new(40);
        let summary = node.run(&mut operator).unwrap();

        assert_eq!(publisher.labels(), vec!["ripe"]);
        assert_eq!(summary.published, 1);
        assert_eq!(summary.frames_flushed, 5);
    }

    #[test]
    fn qualifying_stream_publishes_once_per_cooldown_cycle() {
        let clock = ManualClock::new();
        let publisher = RecordingPublisher {
            clock: Some(clock.clone()),
            ..RecordingPublisher::default()
        };
        let source = ClockedSource {
            clock: clock.clone(),
            interval: Duration::from_millis(33),
            sequence: 0,
        };
        let node = VisionNode::new(
            settings(5),
            Box::new(source),
            Box::new(FixedDetector::new("mold", 0.99)),
            Box::new(publisher.clone()),
        )
        .with_pacer(Box::new(clock.clone()));

        let mut operator = CountdownOperator::new(10);
        let summary = node.run(&mut operator).unwrap();

        // Every scan qualifies, so every scan starts a cycle.
        assert_eq!(summary.frames_scanned, 10);
        assert_eq!(summary.published, 10);

        let sent = publisher.sent.lock().unwrap();
        for pair in sent.windows(2) {
            let gap = pair[1].1 - pair[0].1;
            assert!(
                gap >= Duration::from_secs(6),
                "publishes only {:?} apart",
                gap
            );
        }
    }

    #[test]
    fn missing_frame_is_a_transient_skip() {
        let publisher = RecordingPublisher::default();
        let mut node = VisionNode::new(
            settings(5),
            Box::new(ScriptedSource::scripted(vec![false, false, true])),
            Box::new(FixedDetector::new("ripe", 0.9)),
            Box::new(publisher),
        );
        let mut operator = CountdownOperator::new(10);

        let outcome = node.step(&mut operator).unwrap();
        assert!(matches!(outcome, StepOutcome::Skipped(_)));
        assert!(outcome.is_transient());
        assert!(node.step(&mut operator).unwrap().is_transient());
        assert!(matches!(
            node.step(&mut operator).unwrap(),
            StepOutcome::Classified(_)
        ));
        assert_eq!(node.summary().frames_skipped, 2);
        assert_eq!(operator.shown, 1);
    }

    #[test]
    fn detector_failure_is_fatal() {
        let node = VisionNode::new(
            settings(5),
            Box::new(ScriptedSource::endless()),
            Box::new(BrokenDetector),
            Box::new(RecordingPublisher::default()),
        );
        let mut operator = CountdownOperator::new(10);
        let err = node.run(&mut operator).unwrap_err();
        assert!(format!("{:#}", err).contains("inference session lost"));
    }

    #[test]
    fn publish_failure_still_cools_down() {
        let publisher = RecordingPublisher {
            fail: true,
            ..RecordingPublisher::default()
        };
        let clock = ManualClock::new();
        let mut node = VisionNode::new(
            settings(0),
            Box::new(ScriptedSource::endless()),
            Box::new(FixedDetector::new("ripe", 0.9)),
            Box::new(publisher),
        )
        .with_pacer(Box::new(clock.clone()));
        let mut operator = CountdownOperator::new(10);

        node.step(&mut operator).unwrap();
        let outcome = node.step(&mut operator).unwrap();
        assert!(matches!(outcome, StepOutcome::PublishFailed { .. }));
        assert!(outcome.is_transient());
        assert_eq!(node.state(), &VisionState::Cooldown);

        node.step(&mut operator).unwrap();
        assert_eq!(clock.elapsed(), Duration::from_secs(6));
        assert_eq!(
            node.step(&mut operator).unwrap(),
            StepOutcome::Flushed {
                discarded: 0,
                failed: 0
            }
        );
    }

    #[test]
    fn flush_reads_through_failures() {
        let reads;
        let mut node = {
            let source = ScriptedSource::scripted(vec![true, false, true, false]);
            reads = Arc::clone(&source.reads);
            VisionNode::new(
                settings(3),
                Box::new(source),
                Box::new(FixedDetector::new("ripe", 0.9)),
                Box::new(RecordingPublisher::default()),
            )
            .with_pacer(Box::new(ManualClock::new()))
        };
        let mut operator = CountdownOperator::new(10);

        for _ in 0..3 {
            node.step(&mut operator).unwrap();
        }
        assert_eq!(
            node.step(&mut operator).unwrap(),
            StepOutcome::Flushed {
                discarded: 3,
                failed: 2
            }
        );
        assert_eq!(*reads.lock().unwrap(), 4);
    }

    #[test]
    fn quit_is_checked_before_capture() {
        let source = ScriptedSource::endless();
        let reads = Arc::clone(&source.reads);
        let node = VisionNode::new(
            settings(5),
            Box::new(source),
            Box::new(FixedDetector::new("ripe", 0.9)),
            Box::new(RecordingPublisher::default()),
        );
        let mut operator = CountdownOperator::new(0);
        let summary = node.run(&mut operator).unwrap();
        assert_eq!(summary, VisionSummary::default());
        assert_eq!(*reads.lock().unwrap(), 0);
    }
}
