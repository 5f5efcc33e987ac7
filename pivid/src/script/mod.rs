//! Declarative play scripts: the JSON model and its time curves.

pub mod curve;
pub mod model;

pub use curve::{BezierCurve, BezierSegment, Curve, Repeat};
pub use model::{
    CurveDef, KnotDef, LayerDef, LayerEvalContext, LayerPlacement, LayerPlan, MediaOptions,
    ModeHint, RectDef, Script, ScreenScript, ZeroTime,
};
