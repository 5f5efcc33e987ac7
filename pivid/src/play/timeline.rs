use std::collections::BTreeMap;
use std::sync::Arc;

use crate::display::DisplayFrame;
use crate::foundation::time::SteadyTime;

/// Scheduled output for one screen: scanout instant to composited frame.
///
/// Keys are the wall-clock moments of upcoming vsyncs, strictly increasing by
/// `BTreeMap` construction; frames are shared immutably with the presenting
/// player and the display driver.
pub type Timeline = BTreeMap<SteadyTime, Arc<DisplayFrame>>;

/// True when both timelines schedule the same instants, regardless of the
/// frames at them. A same-keys replacement refreshes frames in place and
/// needs no player wakeup.
pub fn same_keys(a: &Timeline, b: &Timeline) -> bool {
    a.len() == b.len() && a.keys().zip(b.keys()).all(|(x, y)| x == y)
}
