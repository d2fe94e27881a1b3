//! Progress events emitted once per completed command.

use crate::state::PipelineState;
use log::{debug, info};
use std::sync::mpsc::Sender;

/// One finished command, as the presentation layer sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub phase: PipelineState,
    pub command: String,
    pub status: i32,
    pub output: String,
}

/// Anything shown to the operator while the pipeline runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressUpdate {
    State(PipelineState),
    Command(ProgressEvent),
}

/// Receiver of pipeline progress. Implementations must not block for long;
/// the pipeline waits for each call before running the next command.
pub trait ProgressSink {
    fn command_completed(&self, event: &ProgressEvent);

    fn state_changed(&self, _state: PipelineState) {}
}

impl<S: ProgressSink + ?Sized> ProgressSink for &S {
    fn command_completed(&self, event: &ProgressEvent) {
        (**self).command_completed(event)
    }

    fn state_changed(&self, state: PipelineState) {
        (**self).state_changed(state)
    }
}

impl<S: ProgressSink + ?Sized> ProgressSink for std::sync::Arc<S> {
    fn command_completed(&self, event: &ProgressEvent) {
        (**self).command_completed(event)
    }

    fn state_changed(&self, state: PipelineState) {
        (**self).state_changed(state)
    }
}

/// Sink that only writes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn command_completed(&self, event: &ProgressEvent) {
        info!(
            "[{}] {} (exit {})",
            event.phase, event.command, event.status
        );
        if !event.output.is_empty() {
            debug!("{}", event.output);
        }
    }

    fn state_changed(&self, state: PipelineState) {
        info!("pipeline entered {state}");
    }
}

/// Forwards updates to a display thread, preserving completion order.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: Sender<ProgressUpdate>,
}

impl ChannelSink {
    pub fn new(sender: Sender<ProgressUpdate>) -> Self {
        Self { sender }
    }
}

impl ProgressSink for ChannelSink {
    fn command_completed(&self, event: &ProgressEvent) {
        // receiver gone means nobody is watching; the install carries on
        let _ = self.sender.send(ProgressUpdate::Command(event.clone()));
    }

    fn state_changed(&self, state: PipelineState) {
        let _ = self.sender.send(ProgressUpdate::State(state));
    }
}
