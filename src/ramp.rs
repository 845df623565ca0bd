//! Ramp Engine
//!
//! Piecewise-linear control ramps for continuous parameters. A `Ramp` is a
//! value object remembered alongside the automation it produced, so that a
//! later event can truncate it at the current instant instead of letting the
//! parameter jump.

use crate::unit::{AutomationEvent, UnitGraph, UnitId};
use serde::{Deserialize, Serialize};

/// Linear interpolation from `v1` at `t1` to `v2` at `t2`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ramp {
    pub v1: f64,
    pub v2: f64,
    pub t1: f64,
    pub t2: f64,
}

impl Ramp {
    /// Create a ramp. An end time earlier than the start is clamped so that
    /// `t1 <= t2` always holds.
    pub fn new(v1: f64, v2: f64, t1: f64, t2: f64) -> Self {
        Self {
            v1,
            v2,
            t1,
            t2: t2.max(t1),
        }
    }

    pub fn duration(&self) -> f64 {
        self.t2 - self.t1
    }

    /// True iff the ramp has a duration and `t` lies within it
    pub fn inside(&self, t: f64) -> bool {
        self.t1 < self.t2 && self.t1 <= t && t <= self.t2
    }

    /// The same ramp truncated at `t`, ending on the interpolated value
    pub fn cut(&self, t: f64) -> Ramp {
        let v = self.v1 + (self.v2 - self.v1) * (t - self.t1) / (self.t2 - self.t1);
        Ramp::new(self.v1, v, self.t1, t)
    }

    /// Interpolated value at `t`, if `t` falls inside the ramp
    pub fn value_at(&self, t: f64) -> Option<f64> {
        self.inside(t).then(|| self.cut(t).v2)
    }

    /// Issue the ramp as automation on a parameter.
    ///
    /// With `follow` set, the ramp continues from whatever value the
    /// parameter holds at `t1` instead of jumping to `v1` first.
    pub fn run(&self, graph: &mut UnitGraph, unit: UnitId, param: &str, follow: bool) {
        if self.t2 - self.t1 <= 0.0 {
            graph.automate(
                unit,
                param,
                AutomationEvent::SetValue {
                    value: self.v2,
                    time: self.t2,
                },
            );
            return;
        }
        if !follow {
            graph.automate(
                unit,
                param,
                AutomationEvent::SetValue {
                    value: self.v1,
                    time: self.t1,
                },
            );
        }
        graph.automate(
            unit,
            param,
            AutomationEvent::LinearRamp {
                value: self.v2,
                time: self.t2,
            },
        );
    }
}

/// The envelope phase currently shaping a parameter.
///
/// A note-on issues attack and decay together; a note-off replaces them
/// with a release. Only one segment is remembered per parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum EnvelopeSegment {
    Attack { attack: Ramp, decay: Ramp },
    Release(Ramp),
}

impl EnvelopeSegment {
    /// Ramps of the segment in time order
    pub fn ramps(&self) -> impl Iterator<Item = &Ramp> {
        let (first, second) = match self {
            EnvelopeSegment::Attack { attack, decay } => (attack, Some(decay)),
            EnvelopeSegment::Release(release) => (release, None),
        };
        std::iter::once(first).chain(second)
    }

    /// Value at `t` if one of the segment's ramps is in flight at `t`
    pub fn value_at(&self, t: f64) -> Option<f64> {
        self.ramps().find_map(|r| r.value_at(t))
    }

    /// Value held once the segment has run to completion
    pub fn settled_value(&self) -> f64 {
        match self {
            EnvelopeSegment::Attack { decay, .. } => decay.v2,
            EnvelopeSegment::Release(release) => release.v2,
        }
    }

    pub fn end_time(&self) -> f64 {
        match self {
            EnvelopeSegment::Attack { decay, .. } => decay.t2,
            EnvelopeSegment::Release(release) => release.t2,
        }
    }
}

/// Glide settings shared by every voice of an instrument
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Portamento {
    /// Glide time in seconds; 0 disables portamento
    pub time: f64,
    /// Frequency ratio of the previous note, 0 if none yet
    pub ratio: f64,
}

impl Portamento {
    pub fn with_time(time: f64) -> Self {
        Self {
            time: time.max(0.0),
            ratio: 0.0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.time > 0.0 && self.ratio > 0.0
    }
}

/// Scale a parameter by a note ratio at `time`.
///
/// The scaled value becomes the parameter's nominal value. With portamento
/// active the parameter glides from the previous note's equivalent value,
/// starting exactly at `time`; otherwise it is set at `time`.
pub fn ramp_param(
    graph: &mut UnitGraph,
    unit: UnitId,
    param: &str,
    ratio: f64,
    time: f64,
    portamento: &Portamento,
) -> Option<f64> {
    let p = graph.param_mut(unit, param)?;
    let base = p.value();
    let target = base * ratio;
    p.set_nominal(target);

    if portamento.is_active() {
        let from = base * portamento.ratio;
        graph.cancel_scheduled(unit, param, time);
        Ramp::new(from, target, time, time + portamento.time).run(graph, unit, param, false);
    } else {
        graph.automate(
            unit,
            param,
            AutomationEvent::SetValue {
                value: target,
                time,
            },
        );
    }
    Some(target)
}

/// Truncate whichever ramp of `segment` is in flight at `now`, running the
/// truncated ramp immediately. Returns the value reached at `now`.
pub fn reschedule(
    graph: &mut UnitGraph,
    unit: UnitId,
    param: &str,
    segment: &EnvelopeSegment,
    now: f64,
) -> Option<f64> {
    let ramp = segment.ramps().find(|r| r.inside(now))?;
    let cut = ramp.cut(now);
    cut.run(graph, unit, param, false);
    Some(cut.v2)
}
