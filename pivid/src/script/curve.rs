use crate::foundation::error::{PividError, PividResult};

/// One cubic Bézier piece of a [`BezierCurve`].
///
/// The horizontal axis is script time, the vertical axis the output scalar;
/// `p1`/`p2` are the interior control points as `(t, value)` pairs.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BezierSegment {
    pub t_begin: f64,
    pub t_end: f64,
    pub begin_v: f64,
    pub end_v: f64,
    pub p1: (f64, f64),
    pub p2: (f64, f64),
}

impl BezierSegment {
    /// Segment whose value moves linearly from `begin_v` to `end_v`.
    pub fn linear(t_begin: f64, t_end: f64, begin_v: f64, end_v: f64) -> Self {
        let dt = t_end - t_begin;
        let dv = end_v - begin_v;
        Self {
            t_begin,
            t_end,
            begin_v,
            end_v,
            p1: (t_begin + dt / 3.0, begin_v + dv / 3.0),
            p2: (t_begin + dt * 2.0 / 3.0, begin_v + dv * 2.0 / 3.0),
        }
    }

    fn time_at(&self, s: f64) -> f64 {
        cubic(self.t_begin, self.p1.0, self.p2.0, self.t_end, s)
    }

    fn value_at(&self, s: f64) -> f64 {
        cubic(self.begin_v, self.p1.1, self.p2.1, self.end_v, s)
    }

    /// Output value at absolute segment time `t`, `t_begin <= t <= t_end`.
    ///
    /// Endpoints are exact. Interior times are resolved by bisecting the
    /// curve parameter; with monotone-in-t control points this converges to
    /// the unique parameter, and the iteration bound keeps pathological
    /// control placements from spinning.
    pub fn evaluate(&self, t: f64) -> f64 {
        if t <= self.t_begin {
            return self.begin_v;
        }
        if t >= self.t_end {
            return self.end_v;
        }

        let mut lo = 0.0f64;
        let mut hi = 1.0f64;
        for _ in 0..MAX_SOLVE_ITERATIONS {
            if hi - lo <= SOLVE_TOLERANCE {
                break;
            }
            let mid = 0.5 * (lo + hi);
            if self.time_at(mid) < t {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        self.value_at(0.5 * (lo + hi))
    }
}

const MAX_SOLVE_ITERATIONS: u32 = 30;
const SOLVE_TOLERANCE: f64 = 1e-6;

fn cubic(a: f64, b: f64, c: f64, d: f64, s: f64) -> f64 {
    let u = 1.0 - s;
    u * u * u * a + 3.0 * u * u * s * b + 3.0 * u * s * s * c + s * s * s * d
}

/// How a curve maps times outside its base interval.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Repeat {
    /// Undefined outside the base interval.
    #[default]
    Once,
    /// Wrap with the base period.
    Loop,
    /// Triangular reflection: forward then backward, period `2P`.
    Mirror,
}

/// Ordered, contiguous cubic Bézier pieces plus a repeat policy.
#[derive(Clone, Debug, PartialEq)]
pub struct BezierCurve {
    segments: Vec<BezierSegment>,
    pub repeat: Repeat,
    pub phase: f64,
}

impl BezierCurve {
    pub fn new(segments: Vec<BezierSegment>, repeat: Repeat, phase: f64) -> PividResult<Self> {
        if segments.is_empty() {
            return Err(PividError::invalid("curve needs at least one segment"));
        }
        if !phase.is_finite() {
            return Err(PividError::invalid("curve phase must be finite"));
        }
        for seg in &segments {
            let nums = [
                seg.t_begin, seg.t_end, seg.begin_v, seg.end_v, seg.p1.0, seg.p1.1, seg.p2.0,
                seg.p2.1,
            ];
            if nums.iter().any(|x| !x.is_finite()) {
                return Err(PividError::invalid("curve segment values must be finite"));
            }
            if seg.t_end <= seg.t_begin {
                return Err(PividError::invalid(format!(
                    "curve segment times must increase ({} >= {})",
                    seg.t_begin, seg.t_end
                )));
            }
        }
        for pair in segments.windows(2) {
            if pair[1].t_begin != pair[0].t_end {
                return Err(PividError::invalid(format!(
                    "curve segments must share endpoints ({} != {})",
                    pair[0].t_end, pair[1].t_begin
                )));
            }
        }
        Ok(Self {
            segments,
            repeat,
            phase,
        })
    }

    pub fn segments(&self) -> &[BezierSegment] {
        &self.segments
    }

    pub fn domain_begin(&self) -> f64 {
        self.segments[0].t_begin
    }

    pub fn domain_end(&self) -> f64 {
        self.segments[self.segments.len() - 1].t_end
    }

    pub fn period(&self) -> f64 {
        self.domain_end() - self.domain_begin()
    }

    /// Evaluate at script time `t`; `None` outside the domain for `Once`.
    pub fn evaluate(&self, t: f64) -> Option<f64> {
        let begin = self.domain_begin();
        let local = t + self.phase;
        let mapped = match self.repeat {
            Repeat::Once => {
                if local < begin || local > self.domain_end() {
                    return None;
                }
                local
            }
            Repeat::Loop => begin + (local - begin).rem_euclid(self.period()),
            Repeat::Mirror => {
                let period = self.period();
                let m = (local - begin).rem_euclid(2.0 * period);
                begin + if m > period { 2.0 * period - m } else { m }
            }
        };

        // First segment whose end reaches the mapped time; shared endpoints
        // resolve to the earlier segment, whose end value is exact.
        let idx = self
            .segments
            .partition_point(|seg| seg.t_end < mapped)
            .min(self.segments.len() - 1);
        Some(self.segments[idx].evaluate(mapped))
    }
}

/// A scalar layer parameter: fixed, or animated over script time.
#[derive(Clone, Debug, PartialEq)]
pub enum Curve {
    Constant(f64),
    Bezier(BezierCurve),
}

impl Curve {
    pub fn constant(v: f64) -> Self {
        Self::Constant(v)
    }

    pub fn evaluate(&self, t: f64) -> Option<f64> {
        match self {
            Self::Constant(v) => Some(*v),
            Self::Bezier(curve) => curve.evaluate(t),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eased_0_to_1() -> BezierCurve {
        // Classic ease-in-out: flat tangents at both ends.
        BezierCurve::new(
            vec![BezierSegment {
                t_begin: 0.0,
                t_end: 1.0,
                begin_v: 0.0,
                end_v: 1.0,
                p1: (0.42, 0.0),
                p2: (0.58, 1.0),
            }],
            Repeat::Once,
            0.0,
        )
        .expect("valid curve")
    }

    fn two_piece() -> BezierCurve {
        BezierCurve::new(
            vec![
                BezierSegment::linear(0.0, 1.0, 0.0, 2.0),
                BezierSegment::linear(1.0, 3.0, 2.0, 0.0),
            ],
            Repeat::Once,
            0.0,
        )
        .expect("valid curve")
    }

    #[test]
    fn endpoints_are_exact() {
        let c = two_piece();
        assert_eq!(c.evaluate(0.0), Some(0.0));
        assert_eq!(c.evaluate(1.0), Some(2.0));
        assert_eq!(c.evaluate(3.0), Some(0.0));
    }

    #[test]
    fn linear_segment_interpolates_linearly() {
        let c = two_piece();
        let v = c.evaluate(0.5).expect("in domain");
        assert!((v - 1.0).abs() < 1e-5, "got {v}");
    }

    #[test]
    fn once_is_undefined_outside_domain() {
        let c = two_piece();
        assert_eq!(c.evaluate(-0.001), None);
        assert_eq!(c.evaluate(3.001), None);
    }

    #[test]
    fn eased_midpoint_matches_curve_parameter_half() {
        // Symmetric control points make the curve parameter 0.5 land exactly
        // at t = 0.5, so the value must be the Bézier value at s = 0.5.
        let c = eased_0_to_1();
        let v = c.evaluate(0.5).expect("in domain");
        let expected = 0.125 * 0.0 + 0.375 * 0.0 + 0.375 * 1.0 + 0.125 * 1.0;
        assert!((v - expected).abs() < 1e-6, "got {v}, want {expected}");
    }

    #[test]
    fn values_stay_in_control_point_hull() {
        let c = eased_0_to_1();
        let mut t = 0.0;
        while t <= 1.0 {
            let v = c.evaluate(t).expect("in domain");
            assert!((-1e-9..=1.0 + 1e-9).contains(&v), "t={t} v={v}");
            t += 0.01;
        }
    }

    #[test]
    fn loop_is_periodic() {
        let mut c = two_piece();
        c.repeat = Repeat::Loop;
        for t in [0.25, 1.5, 2.9] {
            let a = c.evaluate(t).expect("defined");
            let b = c.evaluate(t + 3.0).expect("defined");
            assert!((a - b).abs() < 1e-9, "t={t}: {a} vs {b}");
        }
    }

    #[test]
    fn mirror_reflects_with_double_period() {
        let mut c = two_piece();
        c.repeat = Repeat::Mirror;
        // Second period runs backwards: t = 3 + x maps to 3 - x.
        for x in [0.25, 1.0, 2.5] {
            let forward = c.evaluate(3.0 - x).expect("defined");
            let reflected = c.evaluate(3.0 + x).expect("defined");
            assert!(
                (forward - reflected).abs() < 1e-9,
                "x={x}: {forward} vs {reflected}"
            );
        }
        // And the full cycle repeats with period 2P.
        let a = c.evaluate(0.5).expect("defined");
        let b = c.evaluate(0.5 + 6.0).expect("defined");
        assert!((a - b).abs() < 1e-9);
    }

    #[test]
    fn phase_shifts_the_domain() {
        let mut c = two_piece();
        c.phase = 1.0;
        assert_eq!(c.evaluate(-1.0), Some(0.0));
        assert_eq!(c.evaluate(0.0), Some(2.0));
        assert_eq!(c.evaluate(2.5), None);
    }

    #[test]
    fn non_monotone_controls_stay_bounded() {
        // Control times outside [t_begin, t_end] make time non-monotone in
        // the parameter; bisection must still terminate with a hull value.
        let c = BezierCurve::new(
            vec![BezierSegment {
                t_begin: 0.0,
                t_end: 1.0,
                begin_v: 0.0,
                end_v: 1.0,
                p1: (1.5, 0.2),
                p2: (-0.5, 0.8),
            }],
            Repeat::Once,
            0.0,
        )
        .expect("valid curve");
        let v = c.evaluate(0.3).expect("in domain");
        assert!((0.0..=1.0).contains(&v), "got {v}");
    }

    #[test]
    fn rejects_overlapping_and_reversed_segments() {
        let reversed = BezierCurve::new(
            vec![BezierSegment::linear(1.0, 0.5, 0.0, 1.0)],
            Repeat::Once,
            0.0,
        );
        assert!(reversed.is_err());

        let gap = BezierCurve::new(
            vec![
                BezierSegment::linear(0.0, 1.0, 0.0, 1.0),
                BezierSegment::linear(1.5, 2.0, 1.0, 0.0),
            ],
            Repeat::Once,
            0.0,
        );
        assert!(gap.is_err());
    }

    #[test]
    fn constant_curve_is_defined_everywhere() {
        let c = Curve::constant(0.75);
        assert_eq!(c.evaluate(-100.0), Some(0.75));
        assert_eq!(c.evaluate(1e9), Some(0.75));
    }
}
