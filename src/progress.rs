//! # Progress reporting and cancellation

/// Receiver of update progress
///
/// The update procedure reports its state through this trait and polls it for
/// cancellation between steps.
pub trait ProgressSink {
    /// Report progress in percent with a short description of the current step
    fn set_progress(&mut self, percent: u8, label: &str);

    /// Whether the user asked to stop the update
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Sink that ignores progress and never cancels
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn set_progress(&mut self, _percent: u8, _label: &str) {}
}

impl<P: ProgressSink + ?Sized> ProgressSink for &mut P {
    fn set_progress(&mut self, percent: u8, label: &str) {
        (**self).set_progress(percent, label)
    }

    fn is_cancelled(&self) -> bool {
        (**self).is_cancelled()
    }
}
