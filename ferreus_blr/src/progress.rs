/////////////////////////////////////////////////////////////////////////////////////////////
//
// Defines diagnostic messages, sinks, and helper functions for long-running BLR computations.
//
// Created on: 15 Nov 2025     Author: Daniel Owen
//
// Copyright (c) 2025, Maptek Pty Ltd. All rights reserved. Licensed under the MIT License.
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! Progress and diagnostic reporting primitives.
//!
//! The core algorithms never print. Anything a caller may want to observe,
//! such as a block format being rebuilt after false far-field blocks were
//! found, is emitted as a [`ProgressMsg`] through an injected [`ProgressSink`].

use std::fmt::Debug;
use std::sync::{Arc, mpsc};
use std::thread;

/// Progress and diagnostic events emitted during long-running computations.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressMsg {
    /// Number of far-field blocks processed by the compression engine.
    BlocksCompressed { done: usize, total: usize },

    /// The block format was replaced because some far-field blocks were not
    /// compressible and have been moved to the near field.
    FormatReclassified {
        false_far: usize,
        far: usize,
        near: usize,
    },

    /// Event indicating iteration status for an iterative solver.
    SolverIteration {
        iter: usize,
        residual: f64,
        progress: f64,
    },

    /// Arbitrary informational message.
    Message { message: String },
}

/// Sink that consumes progress messages.
pub trait ProgressSink: Send + Sync + Debug {
    fn emit(&self, msg: ProgressMsg);
}

/// Progress sink that forwards messages over a channel.
#[derive(Debug)]
pub struct ClosureSink {
    tx: mpsc::SyncSender<ProgressMsg>,
}

impl ProgressSink for ClosureSink {
    #[inline]
    fn emit(&self, msg: ProgressMsg) {
        let _ = self.tx.try_send(msg);
    }
}

/// Spawns a listener thread that runs a handler closure for each progress message.
///
/// The listener exits once every clone of the returned sink has been dropped.
pub fn closure_sink<F>(
    buffer: usize,
    mut handler: F,
) -> (Arc<dyn ProgressSink>, thread::JoinHandle<()>)
where
    F: FnMut(ProgressMsg) + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel::<ProgressMsg>(buffer.max(1));
    let sink: Arc<dyn ProgressSink> = Arc::new(ClosureSink { tx });

    let handle = thread::spawn(move || {
        while let Ok(msg) = rx.recv() {
            handler(msg);
        }
    });

    (sink, handle)
}

/// Emits `msg` if a sink is attached.
#[inline]
pub(crate) fn emit(sink: &Option<Arc<dyn ProgressSink>>, msg: ProgressMsg) {
    if let Some(sink) = sink {
        sink.emit(msg);
    }
}

/// Calculates the fraction of solver progress based on the current residual
/// and the requested tolerance. Returns a value in `[0, 1]`.
#[inline]
pub fn progress_from_rel(current_res: f64, start_res: f64, target_res: f64) -> f64 {
    if current_res <= target_res || start_res <= target_res {
        1.0
    } else {
        let p = (start_res.log10() - current_res.log10())
            / (start_res.log10() - target_res.log10());
        p.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct Collect(Mutex<Vec<ProgressMsg>>);

    impl ProgressSink for Collect {
        fn emit(&self, msg: ProgressMsg) {
            self.0.lock().unwrap().push(msg);
        }
    }

    #[test]
    fn closure_sink_delivers_messages_in_order() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();
        let (sink, handle) = closure_sink(8, move |msg| {
            received_clone.lock().unwrap().push(msg);
        });

        sink.emit(ProgressMsg::Message {
            message: "first".into(),
        });
        sink.emit(ProgressMsg::BlocksCompressed { done: 1, total: 2 });
        drop(sink);
        handle.join().unwrap();

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 2);
        assert_eq!(
            received[1],
            ProgressMsg::BlocksCompressed { done: 1, total: 2 }
        );
    }

    #[test]
    fn emit_is_a_no_op_without_sink() {
        emit(&None, ProgressMsg::Message { message: "ignored".into() });

        let collector = Arc::new(Collect::default());
        let sink: Option<Arc<dyn ProgressSink>> = Some(collector.clone());
        emit(&sink, ProgressMsg::Message { message: "kept".into() });
        assert_eq!(collector.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn relative_progress_is_clamped() {
        assert_eq!(progress_from_rel(1e-9, 1.0, 1e-6), 1.0);
        assert!((progress_from_rel(1e-3, 1.0, 1e-6) - 0.5).abs() < 1e-12);
        assert_eq!(progress_from_rel(10.0, 1.0, 1e-6), 0.0);
    }
}
