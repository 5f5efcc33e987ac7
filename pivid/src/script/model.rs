use std::collections::BTreeMap;
use std::path::Component;

use kurbo::Rect;
use serde::{Deserialize, Serialize};

use crate::foundation::error::{PividError, PividResult};
use crate::script::curve::{BezierCurve, BezierSegment, Curve, Repeat};

/// Wall-clock anchor for script time zero.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ZeroTime {
    /// Anchor to the moment the script is posted.
    Now,
    /// Absolute seconds since the Unix epoch.
    At(f64),
}

impl Default for ZeroTime {
    fn default() -> Self {
        Self::Now
    }
}

impl Serialize for ZeroTime {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Self::Now => serializer.serialize_str("now"),
            Self::At(secs) => serializer.serialize_f64(*secs),
        }
    }
}

impl<'de> Deserialize<'de> for ZeroTime {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Num(f64),
            Str(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Num(secs) => Ok(Self::At(secs)),
            Repr::Str(s) if s == "now" => Ok(Self::Now),
            Repr::Str(s) => Err(serde::de::Error::custom(format!(
                "zero_time must be \"now\" or seconds since epoch, got \"{s}\""
            ))),
        }
    }
}

/// Top-level play script: what each screen shows at each wall-clock moment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Script {
    #[serde(default)]
    pub zero_time: ZeroTime,
    #[serde(default = "default_main_loop_hz")]
    pub main_loop_hz: f64,
    #[serde(default)]
    pub media: BTreeMap<String, MediaOptions>,
    #[serde(default)]
    pub screens: BTreeMap<String, ScreenScript>,
}

fn default_main_loop_hz() -> f64 {
    30.0
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MediaOptions {
    /// Decode origin within the media, seconds.
    #[serde(default)]
    pub seek: f64,
    /// How far past the newest requested pts the decoder reads ahead, seconds.
    #[serde(default = "default_buffer_ahead")]
    pub buffer_ahead: f64,
}

impl Default for MediaOptions {
    fn default() -> Self {
        Self {
            seek: 0.0,
            buffer_ahead: default_buffer_ahead(),
        }
    }
}

fn default_buffer_ahead() -> f64 {
    0.2
}

/// Requested display mode as `[width, height, hz]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModeHint(pub u32, pub u32, pub f64);

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScreenScript {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ModeHint>,
    #[serde(default)]
    pub layers: Vec<LayerDef>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerDef {
    /// Media path, relative to the media root.
    pub media: String,
    /// Media pts (seconds) as a function of script time.
    #[serde(default = "CurveDef::zero")]
    pub from: CurveDef,
    /// Destination rectangle; omitted means the full screen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen: Option<RectDef>,
    /// Source rectangle; omitted means the full media frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_rect: Option<RectDef>,
    #[serde(default = "CurveDef::one")]
    pub alpha: CurveDef,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RectDef {
    pub x: CurveDef,
    pub y: CurveDef,
    pub w: CurveDef,
    pub h: CurveDef,
}

/// A curve as written in a script: a bare scalar or explicit Bézier knots.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CurveDef {
    Scalar(f64),
    Segments(SegmentListDef),
}

impl CurveDef {
    pub fn zero() -> Self {
        Self::Scalar(0.0)
    }

    pub fn one() -> Self {
        Self::Scalar(1.0)
    }

    pub fn compile(&self) -> PividResult<Curve> {
        match self {
            Self::Scalar(v) => {
                if !v.is_finite() {
                    return Err(PividError::invalid("curve scalar must be finite"));
                }
                Ok(Curve::Constant(*v))
            }
            Self::Segments(list) => list.compile().map(Curve::Bezier),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentListDef {
    pub segments: Vec<KnotDef>,
    #[serde(default)]
    pub repeat: Repeat,
    #[serde(default)]
    pub phase: f64,
}

/// One knot of an explicit curve.
///
/// A knot's `c1`/`c2` controls shape the segment leaving it; the last knot's
/// controls are ignored. Omitted controls fall back to the linear placement.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct KnotDef {
    pub t: f64,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub c1_t: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub c1_v: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub c2_t: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub c2_v: Option<f64>,
}

impl SegmentListDef {
    fn compile(&self) -> PividResult<BezierCurve> {
        if self.segments.len() < 2 {
            return Err(PividError::invalid(
                "an explicit curve needs at least two knots",
            ));
        }

        let mut segments = Vec::with_capacity(self.segments.len() - 1);
        for pair in self.segments.windows(2) {
            let (knot, next) = (pair[0], pair[1]);
            let linear =
                BezierSegment::linear(knot.t, next.t, knot.value, next.value);
            segments.push(BezierSegment {
                p1: (
                    knot.c1_t.unwrap_or(linear.p1.0),
                    knot.c1_v.unwrap_or(linear.p1.1),
                ),
                p2: (
                    knot.c2_t.unwrap_or(linear.p2.0),
                    knot.c2_v.unwrap_or(linear.p2.1),
                ),
                ..linear
            });
        }
        BezierCurve::new(segments, self.repeat, self.phase)
    }
}

impl Script {
    /// Parse a JSON script. Syntax errors are `Format`; semantic problems
    /// surface from [`Script::validate`] as `Invalid`.
    pub fn from_json(text: &str) -> PividResult<Self> {
        let script: Script = serde_json::from_str(text)
            .map_err(|e| PividError::format(format!("script parse: {e}")))?;
        script.validate()?;
        Ok(script)
    }

    /// Canonical JSON form; parse ∘ serialize is the identity.
    pub fn to_json(&self) -> PividResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| PividError::format(format!("script serialize: {e}")))
    }

    pub fn validate(&self) -> PividResult<()> {
        if !self.main_loop_hz.is_finite() || self.main_loop_hz <= 0.0 {
            return Err(PividError::invalid(format!(
                "main_loop_hz must be positive, got {}",
                self.main_loop_hz
            )));
        }
        if let ZeroTime::At(secs) = self.zero_time {
            if !secs.is_finite() {
                return Err(PividError::invalid("zero_time must be finite"));
            }
        }
        for (path, opts) in &self.media {
            check_media_path(path)?;
            if !opts.seek.is_finite() || opts.seek < 0.0 {
                return Err(PividError::invalid(format!(
                    "media \"{path}\": seek must be >= 0"
                )));
            }
            if !opts.buffer_ahead.is_finite() || opts.buffer_ahead < 0.0 {
                return Err(PividError::invalid(format!(
                    "media \"{path}\": buffer_ahead must be >= 0"
                )));
            }
        }
        for (name, screen) in &self.screens {
            if let Some(ModeHint(w, h, hz)) = screen.mode {
                if w == 0 || h == 0 || !hz.is_finite() || hz <= 0.0 {
                    return Err(PividError::invalid(format!(
                        "screen \"{name}\": bad mode hint [{w}, {h}, {hz}]"
                    )));
                }
            }
            for layer in &screen.layers {
                check_media_path(&layer.media)?;
                layer.compile()?;
            }
        }
        Ok(())
    }

    /// Decode options for a media path, defaults when the script has none.
    pub fn media_options(&self, path: &str) -> MediaOptions {
        self.media.get(path).copied().unwrap_or_default()
    }
}

fn check_media_path(path: &str) -> PividResult<()> {
    if path.is_empty() {
        return Err(PividError::invalid("media path must not be empty"));
    }
    let p = std::path::Path::new(path);
    if p.is_absolute() {
        return Err(PividError::invalid(format!(
            "media path \"{path}\" must be relative to the media root"
        )));
    }
    if p.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(PividError::invalid(format!(
            "media path \"{path}\" must not traverse above the media root"
        )));
    }
    Ok(())
}

/// A layer with its curves compiled, ready for per-instant evaluation.
#[derive(Clone, Debug)]
pub struct LayerPlan {
    pub media: String,
    pub from: Curve,
    pub screen: Option<RectPlan>,
    pub media_rect: Option<RectPlan>,
    pub alpha: Curve,
}

#[derive(Clone, Debug)]
pub struct RectPlan {
    pub x: Curve,
    pub y: Curve,
    pub w: Curve,
    pub h: Curve,
}

impl RectPlan {
    fn evaluate(&self, t: f64) -> Option<Rect> {
        let x = self.x.evaluate(t)?;
        let y = self.y.evaluate(t)?;
        let w = self.w.evaluate(t)?;
        let h = self.h.evaluate(t)?;
        Some(Rect::new(x, y, x + w, y + h))
    }
}

impl LayerDef {
    pub fn compile(&self) -> PividResult<LayerPlan> {
        let compile_rect = |rect: &Option<RectDef>| -> PividResult<Option<RectPlan>> {
            match rect {
                None => Ok(None),
                Some(r) => Ok(Some(RectPlan {
                    x: r.x.compile()?,
                    y: r.y.compile()?,
                    w: r.w.compile()?,
                    h: r.h.compile()?,
                })),
            }
        };
        Ok(LayerPlan {
            media: self.media.clone(),
            from: self.from.compile()?,
            screen: compile_rect(&self.screen)?,
            media_rect: compile_rect(&self.media_rect)?,
            alpha: self.alpha.compile()?,
        })
    }
}

/// Media facts a layer evaluation needs.
#[derive(Clone, Copy, Debug)]
pub struct LayerEvalContext {
    /// Active mode size of the target screen, pixels.
    pub screen_size: (f64, f64),
    /// Coded media frame size, pixels.
    pub media_size: (f64, f64),
    /// Media duration in seconds, if known.
    pub media_duration: Option<f64>,
}

/// A layer's concrete parameters at one instant.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LayerPlacement {
    /// Wanted media pts, seconds, clamped to `[0, duration]`.
    pub media_pts: f64,
    pub screen_rect: Rect,
    pub media_rect: Rect,
    pub alpha: f64,
}

impl LayerPlan {
    /// Evaluate at script time `t`; `None` when the layer is culled
    /// (transparent, zero area, or outside its `from` curve's domain).
    pub fn evaluate(&self, t: f64, ctx: &LayerEvalContext) -> Option<LayerPlacement> {
        let alpha = self.alpha.evaluate(t)?;
        if alpha <= 0.0 {
            return None;
        }
        let from = self.from.evaluate(t)?;

        let screen_rect = match &self.screen {
            Some(plan) => plan.evaluate(t)?,
            None => Rect::new(0.0, 0.0, ctx.screen_size.0, ctx.screen_size.1),
        };
        let media_rect = match &self.media_rect {
            Some(plan) => plan.evaluate(t)?,
            None => Rect::new(0.0, 0.0, ctx.media_size.0, ctx.media_size.1),
        };
        if screen_rect.width() <= 0.0
            || screen_rect.height() <= 0.0
            || media_rect.width() <= 0.0
            || media_rect.height() <= 0.0
        {
            return None;
        }

        let mut media_pts = from.max(0.0);
        if let Some(duration) = ctx.media_duration {
            media_pts = media_pts.min(duration);
        }

        Some(LayerPlacement {
            media_pts,
            screen_rect,
            media_rect,
            alpha: alpha.min(1.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> LayerEvalContext {
        LayerEvalContext {
            screen_size: (1920.0, 1080.0),
            media_size: (640.0, 360.0),
            media_duration: Some(10.0),
        }
    }

    #[test]
    fn minimal_script_gets_defaults() {
        let script = Script::from_json(
            r#"{"screens": {"HDMI-1": {"layers": [{"media": "clip.mp4"}]}}}"#,
        )
        .expect("parses");
        assert_eq!(script.zero_time, ZeroTime::Now);
        assert_eq!(script.main_loop_hz, 30.0);
        let layer = &script.screens["HDMI-1"].layers[0];
        assert_eq!(layer.from, CurveDef::Scalar(0.0));
        assert_eq!(layer.alpha, CurveDef::Scalar(1.0));
        assert_eq!(script.media_options("clip.mp4").buffer_ahead, 0.2);
    }

    #[test]
    fn explicit_curve_parses_and_compiles() {
        let script = Script::from_json(
            r#"{
                "zero_time": 1700000000.0,
                "screens": {
                    "HDMI-1": {
                        "mode": [1920, 1080, 60.0],
                        "layers": [{
                            "media": "clip.mp4",
                            "from": {
                                "segments": [
                                    {"t": 0.0, "value": 0.0},
                                    {"t": 10.0, "value": 10.0}
                                ],
                                "repeat": "loop"
                            },
                            "alpha": 0.5
                        }]
                    }
                }
            }"#,
        )
        .expect("parses");
        let plan = script.screens["HDMI-1"].layers[0].compile().expect("compiles");
        let mid = plan.from.evaluate(5.0).expect("defined");
        assert!((mid - 5.0).abs() < 1e-4, "got {mid}");
        // Loop wraps past the domain end.
        let wrapped = plan.from.evaluate(15.0).expect("defined");
        assert!((wrapped - 5.0).abs() < 1e-4, "got {wrapped}");
    }

    #[test]
    fn serialize_then_parse_is_identity() {
        let script = Script::from_json(
            r#"{
                "zero_time": "now",
                "main_loop_hz": 24.0,
                "media": {"clip.mp4": {"seek": 1.5, "buffer_ahead": 0.4}},
                "screens": {
                    "HDMI-1": {
                        "layers": [{
                            "media": "clip.mp4",
                            "from": {"segments": [
                                {"t": 0.0, "value": 0.0, "c1_t": 0.1, "c1_v": 0.0},
                                {"t": 1.0, "value": 1.0}
                            ]},
                            "screen": {"x": 0.0, "y": 0.0, "w": 960.0, "h": 540.0}
                        }]
                    }
                }
            }"#,
        )
        .expect("parses");
        let json = script.to_json().expect("serializes");
        let reparsed = Script::from_json(&json).expect("reparses");
        assert_eq!(script, reparsed);
    }

    #[test]
    fn non_monotone_knots_are_invalid() {
        let err = Script::from_json(
            r#"{"screens": {"A": {"layers": [{
                "media": "x.mp4",
                "from": {"segments": [{"t": 1.0, "value": 0.0}, {"t": 0.5, "value": 1.0}]}
            }]}}}"#,
        )
        .expect_err("rejected");
        assert_eq!(err.kind(), crate::foundation::error::ErrorKind::Invalid);
    }

    #[test]
    fn traversing_media_paths_are_invalid() {
        for path in ["../etc/passwd", "/etc/passwd", ""] {
            let json = format!(
                r#"{{"screens": {{"A": {{"layers": [{{"media": "{path}"}}]}}}}}}"#
            );
            let err = Script::from_json(&json).expect_err("rejected");
            assert_eq!(err.kind(), crate::foundation::error::ErrorKind::Invalid);
        }
    }

    #[test]
    fn syntax_errors_are_format_not_invalid() {
        let err = Script::from_json("{not json").expect_err("rejected");
        assert_eq!(err.kind(), crate::foundation::error::ErrorKind::Format);
    }

    #[test]
    fn layer_defaults_fill_both_rects() {
        let layer = LayerDef {
            media: "clip.mp4".to_owned(),
            from: CurveDef::Scalar(3.0),
            screen: None,
            media_rect: None,
            alpha: CurveDef::one(),
        };
        let placement = layer
            .compile()
            .expect("compiles")
            .evaluate(0.0, &ctx())
            .expect("visible");
        assert_eq!(placement.screen_rect, Rect::new(0.0, 0.0, 1920.0, 1080.0));
        assert_eq!(placement.media_rect, Rect::new(0.0, 0.0, 640.0, 360.0));
        assert_eq!(placement.media_pts, 3.0);
    }

    #[test]
    fn transparent_and_zero_area_layers_are_culled() {
        let mut layer = LayerDef {
            media: "clip.mp4".to_owned(),
            from: CurveDef::zero(),
            screen: None,
            media_rect: None,
            alpha: CurveDef::Scalar(0.0),
        };
        assert!(layer.compile().unwrap().evaluate(0.0, &ctx()).is_none());

        layer.alpha = CurveDef::one();
        layer.screen = Some(RectDef {
            x: CurveDef::zero(),
            y: CurveDef::zero(),
            w: CurveDef::Scalar(0.0),
            h: CurveDef::Scalar(100.0),
        });
        assert!(layer.compile().unwrap().evaluate(0.0, &ctx()).is_none());
    }

    #[test]
    fn media_pts_clamps_to_duration() {
        let layer = LayerDef {
            media: "clip.mp4".to_owned(),
            from: CurveDef::Scalar(99.0),
            screen: None,
            media_rect: None,
            alpha: CurveDef::one(),
        };
        let placement = layer
            .compile()
            .unwrap()
            .evaluate(0.0, &ctx())
            .expect("visible");
        assert_eq!(placement.media_pts, 10.0);
    }
}
