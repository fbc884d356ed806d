//! Wiring [`RecordLog`]/[`ReplayLog`] into `trapmon-io`'s [`IoJournal`]
//! seam. Any disagreement here is the fatal case §7 describes ("log
//! mismatch — fatal in replay mode"): the reference monitor's
//! `replay_log_scanf` calls `ABORT()` on a short match, so these impls
//! panic rather than returning a recoverable error — there is nothing a
//! caller could do to continue correctly past a desynced log.

use crate::record::RecordLog;
use crate::replay::ReplayLog;
use std::io::{BufRead, Write};
use trapmon_io::{IoJournal, IoWidth};

impl<W: Write> IoJournal for RecordLog<W> {
    fn record_in(&mut self, n_exec: u64, port: u16, width: IoWidth, value: u32) {
        self.write_in(n_exec, port, width, value)
            .expect("record log write failed");
    }

    fn record_out(&mut self, n_exec: u64, port: u16, width: IoWidth, _value: u32) {
        self.write_out(n_exec, port, width).expect("record log write failed");
    }

    fn replay_in(&mut self, _n_exec: u64, _port: u16, _width: IoWidth) -> u32 {
        unreachable!("a RecordLog is never asked to replay")
    }

    fn replay_out(&mut self, _n_exec: u64, _port: u16, _width: IoWidth) {
        unreachable!("a RecordLog is never asked to replay")
    }
}

impl<R: BufRead> IoJournal for ReplayLog<R> {
    fn record_in(&mut self, _n_exec: u64, _port: u16, _width: IoWidth, _value: u32) {
        unreachable!("a ReplayLog is never asked to record")
    }

    fn record_out(&mut self, _n_exec: u64, _port: u16, _width: IoWidth, _value: u32) {
        unreachable!("a ReplayLog is never asked to record")
    }

    fn replay_in(&mut self, _n_exec: u64, port: u16, width: IoWidth) -> u32 {
        let (logged_port, logged_width, value) = self
            .expect_in()
            .unwrap_or_else(|e| panic!("replay log mismatch on IN: {e}"));
        if logged_port != port || logged_width != width {
            panic!(
                "replay log IN mismatch: guest accessed port {port:#06x}/{width:?}, log has \
                 {logged_port:#06x}/{logged_width:?}"
            );
        }
        value
    }

    fn replay_out(&mut self, _n_exec: u64, port: u16, width: IoWidth) {
        let (logged_port, logged_width) = self
            .expect_out()
            .unwrap_or_else(|e| panic!("replay log mismatch on OUT: {e}"));
        if logged_port != port || logged_width != width {
            panic!(
                "replay log OUT mismatch: guest accessed port {port:#06x}/{width:?}, log has \
                 {logged_port:#06x}/{logged_width:?}"
            );
        }
    }
}
