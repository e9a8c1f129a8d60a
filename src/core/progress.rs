//! Progress reporting between a blocking separation run and the task store.
//!
//! A run reports `(percent, stage)` pairs through a [`ProgressListener`].
//! Each phase of a run owns a fixed slice of the 0..=100 range, and nested
//! work with its own counter is mapped into that slice by [`StageTracker`].
//! A negative percentage means the run failed; the stage text then carries
//! the error message.

/// Percentage reported alongside a failure message.
pub const FAILURE_SENTINEL: f64 = -1.0;

pub trait ProgressListener: Send + Sync {
    fn on_progress(&self, percent: f64, stage: &str);

    fn fail(&self, message: &str) {
        self.on_progress(FAILURE_SENTINEL, &format!("Failed: {message}"));
    }
}

impl<F> ProgressListener for F
where
    F: Fn(f64, &str) + Send + Sync,
{
    fn on_progress(&self, percent: f64, stage: &str) {
        self(percent, stage)
    }
}

pub struct NoOpListener;

impl ProgressListener for NoOpListener {
    fn on_progress(&self, _percent: f64, _stage: &str) {}
}

/// Fixed slices of a separation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    LoadModel,
    Decode,
    Separate,
    Augment,
    Finalize,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::Init,
        Phase::LoadModel,
        Phase::Decode,
        Phase::Separate,
        Phase::Augment,
        Phase::Finalize,
    ];

    pub fn range(self) -> (f64, f64) {
        match self {
            Phase::Init => (0.0, 5.0),
            Phase::LoadModel => (5.0, 20.0),
            Phase::Decode => (20.0, 35.0),
            Phase::Separate => (35.0, 70.0),
            Phase::Augment => (70.0, 90.0),
            Phase::Finalize => (90.0, 100.0),
        }
    }

    pub fn base(self) -> f64 {
        self.range().0
    }

    pub fn max(self) -> f64 {
        self.range().1
    }

    pub fn label(self) -> &'static str {
        match self {
            Phase::Init => "Initializing",
            Phase::LoadModel => "Loading model",
            Phase::Decode => "Loading audio",
            Phase::Separate => "Separating",
            Phase::Augment => "Test-time augmentation",
            Phase::Finalize => "Saving outputs",
        }
    }
}

/// Map `current / total` into `[base, max]`. `None` when `total` is zero.
pub fn interpolate(base: f64, max: f64, current: u64, total: u64) -> Option<f64> {
    if total == 0 {
        return None;
    }
    let ratio = (current as f64 / total as f64).min(1.0);
    Some(base + (max - base) * ratio)
}

/// Counter for nested work reported inside one sub-range.
pub struct StageTracker<'a> {
    listener: &'a dyn ProgressListener,
    base: f64,
    max: f64,
    current: u64,
    total: u64,
    desc: String,
}

impl<'a> StageTracker<'a> {
    pub fn new(listener: &'a dyn ProgressListener, base: f64, max: f64) -> Self {
        Self {
            listener,
            base,
            max,
            current: 0,
            total: 0,
            desc: String::new(),
        }
    }

    pub fn for_phase(listener: &'a dyn ProgressListener, phase: Phase) -> Self {
        let (base, max) = phase.range();
        Self::new(listener, base, max)
    }

    pub fn start(&mut self, total: u64, desc: impl Into<String>) {
        self.total = total;
        self.current = 0;
        self.desc = desc.into();
        self.report();
    }

    pub fn advance(&mut self, n: u64) {
        self.current = self.current.saturating_add(n);
        self.report();
    }

    pub fn finish(&mut self) {
        self.listener
            .on_progress(self.max, &format!("{} complete", self.desc));
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    fn report(&self) {
        if let Some(percent) = interpolate(self.base, self.max, self.current, self.total) {
            let stage = format!("{} ({}/{})", self.desc, self.current.min(self.total), self.total);
            self.listener.on_progress(percent, &stage);
        }
    }
}

/// What a single callback means for the task.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Update { percent: f64, stage: String },
    Failed { message: String },
    /// NaN; carries no position and is dropped.
    Ignored,
}

impl ProgressEvent {
    pub fn classify(percent: f64, stage: &str) -> Self {
        if percent.is_nan() {
            ProgressEvent::Ignored
        } else if percent < 0.0 {
            let message = stage.strip_prefix("Failed: ").unwrap_or(stage);
            ProgressEvent::Failed {
                message: message.to_string(),
            }
        } else {
            ProgressEvent::Update {
                percent: percent.min(100.0),
                stage: stage.to_string(),
            }
        }
    }
}

/// Drops reports that would move progress backwards within a run.
#[derive(Debug, Default)]
pub struct MonotonicGate {
    last: Option<f64>,
}

impl MonotonicGate {
    pub fn admit(&mut self, percent: f64) -> Option<f64> {
        match self.last {
            Some(last) if percent < last => None,
            _ => {
                self.last = Some(percent);
                Some(percent)
            }
        }
    }

    pub fn last(&self) -> Option<f64> {
        self.last
    }
}
