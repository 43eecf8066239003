//! # Vision mode scheduling
//!
//! Which detectors run on which frames. Modes are enabled and disabled as a
//! set, and each enabled mode runs on the duty cycle given by the top of a
//! schedule stack. All mutation is queued and applied at frame boundaries so
//! that a frame is processed under one consistent schedule.

/// One vision processing mode.
///
/// Only `Motion` has a detector in this crate; the remaining modes exist so
/// that their scheduling can be exercised by callers that own those
/// detectors. `Idle` is the sentinel "do nothing" mode and is mutually
/// exclusive with every other mode.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub enum VisionMode {
    Idle = 0,
    Motion,
    Markers,
    Faces,
    Pets,
    Illumination,
}

impl VisionMode {
    pub const COUNT: usize = 6;
    pub const ALL: [VisionMode; Self::COUNT] = [
        VisionMode::Idle,
        VisionMode::Motion,
        VisionMode::Markers,
        VisionMode::Faces,
        VisionMode::Pets,
        VisionMode::Illumination,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Small set of vision modes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct ModeSet(u64);

impl ModeSet {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn insert(&mut self, mode: VisionMode) {
        self.0 |= 1 << mode.index();
    }

    pub fn remove(&mut self, mode: VisionMode) {
        self.0 &= !(1 << mode.index());
    }

    pub fn contains(&self, mode: VisionMode) -> bool {
        self.0 & (1 << mode.index()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = VisionMode> + '_ {
        VisionMode::ALL.into_iter().filter(|m| self.contains(*m))
    }
}

impl FromIterator<VisionMode> for ModeSet {
    fn from_iter<I: IntoIterator<Item = VisionMode>>(iter: I) -> Self {
        let mut set = Self::empty();
        for mode in iter {
            set.insert(mode);
        }
        set
    }
}

/// How often an enabled mode actually runs.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub enum DutyCycle {
    Always,
    Never,
    /// Every `n`-th frame, starting with the first frame after enabling.
    /// `EveryNth(0)` never runs.
    EveryNth(u32),
    /// Cyclic per-frame pattern. An empty pattern never runs.
    Pattern(Vec<bool>),
}

impl DutyCycle {
    fn active(&self, tick: u64) -> bool {
        match self {
            DutyCycle::Always => true,
            DutyCycle::Never => false,
            DutyCycle::EveryNth(n) => *n != 0 && tick % u64::from(*n) == 0,
            DutyCycle::Pattern(p) => !p.is_empty() && p[(tick % p.len() as u64) as usize],
        }
    }
}

/// Duty cycle for every mode at once. One of these sits at each level of the
/// scheduler's stack.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct ModeSchedule {
    cycles: [DutyCycle; VisionMode::COUNT],
}

impl ModeSchedule {
    /// Schedule with the same duty cycle for every mode.
    pub fn uniform(cycle: DutyCycle) -> Self {
        Self {
            cycles: [
                cycle.clone(),
                cycle.clone(),
                cycle.clone(),
                cycle.clone(),
                cycle.clone(),
                cycle,
            ],
        }
    }

    pub fn with(mut self, mode: VisionMode, cycle: DutyCycle) -> Self {
        self.cycles[mode.index()] = cycle;
        self
    }

    fn cycle(&self, mode: VisionMode) -> &DutyCycle {
        &self.cycles[mode.index()]
    }
}

impl Default for ModeSchedule {
    fn default() -> Self {
        Self::uniform(DutyCycle::Always)
    }
}

#[derive(Clone, Debug)]
enum Request {
    Enable(VisionMode, bool),
    Push(ModeSchedule),
    Pop,
}

/// Frame-synchronous mode scheduler.
///
/// Requests queue up at any time and take effect at the next
/// [`begin_frame`](Self::begin_frame); within one frame every
/// [`should_process`](Self::should_process) query sees the same answer.
///
/// The schedule stack always keeps its base entry. Temporary overrides are
/// pushed on top and popped off; popping past the base is ignored.
#[derive(Clone, Debug)]
pub struct ModeScheduler {
    enabled: ModeSet,
    stack: Vec<ModeSchedule>,
    ticks: [u64; VisionMode::COUNT],
    pending: Vec<Request>,
}

impl ModeScheduler {
    /// Start with `base` as the permanent bottom of the schedule stack and
    /// only `Idle` enabled.
    pub fn new(base: ModeSchedule) -> Self {
        let mut enabled = ModeSet::empty();
        enabled.insert(VisionMode::Idle);

        Self {
            enabled,
            stack: vec![base],
            // First begin_frame wraps these to tick zero
            ticks: [u64::MAX; VisionMode::COUNT],
            pending: vec![],
        }
    }

    /// Queue enabling or disabling a mode.
    pub fn enable(&mut self, mode: VisionMode, enabled: bool) {
        self.pending.push(Request::Enable(mode, enabled));
    }

    /// Queue a temporary schedule override.
    pub fn push_schedule(&mut self, schedule: ModeSchedule) {
        self.pending.push(Request::Push(schedule));
    }

    /// Queue removal of the top schedule override.
    pub fn pop_schedule(&mut self) {
        self.pending.push(Request::Pop);
    }

    /// Apply queued requests and advance the duty-cycle cursors. Call once
    /// per frame before any `should_process` query.
    pub fn begin_frame(&mut self) {
        for request in std::mem::take(&mut self.pending) {
            match request {
                Request::Enable(VisionMode::Idle, true) => {
                    self.enabled = ModeSet::empty();
                    self.enabled.insert(VisionMode::Idle);
                }
                Request::Enable(mode, true) => {
                    self.enabled.remove(VisionMode::Idle);
                    if !self.enabled.contains(mode) {
                        self.enabled.insert(mode);
                        // Duty cycle restarts on enabling
                        self.ticks[mode.index()] = u64::MAX;
                    }
                }
                Request::Enable(mode, false) => {
                    self.enabled.remove(mode);
                    if self.enabled.is_empty() {
                        self.enabled.insert(VisionMode::Idle);
                    }
                }
                Request::Push(schedule) => self.stack.push(schedule),
                Request::Pop => {
                    if self.stack.len() > 1 {
                        self.stack.pop();
                    } else {
                        log::warn!("ignoring schedule pop, the base schedule is permanent");
                    }
                }
            }
        }

        for tick in &mut self.ticks {
            *tick = tick.wrapping_add(1);
        }
    }

    /// Whether `mode` should run on the current frame.
    pub fn should_process(&self, mode: VisionMode) -> bool {
        self.enabled.contains(mode)
            && self
                .stack
                .last()
                .expect("schedule stack keeps its base entry")
                .cycle(mode)
                .active(self.ticks[mode.index()])
    }

    /// Set of currently enabled modes.
    pub fn enabled_modes(&self) -> ModeSet {
        self.enabled
    }

    pub fn is_idle(&self) -> bool {
        self.enabled.contains(VisionMode::Idle)
    }
}
