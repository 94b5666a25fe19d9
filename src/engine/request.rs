//! Pooled I/O Request Records
//!
//! One `IoRequest` mirrors one gateway operation (or one synthetic
//! resynchronization copy) while it fans out across the two components. The
//! record is shared through an `Arc`: a write is cloned onto both component
//! send queues, each component records its outcome in its own error slot, and
//! the last component to hit the join countdown routes the request onward.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Mutex;

use crate::protocol::{Command, OpStatus};

/// Local component index
pub const LOCAL: usize = 0;
/// Remote component index
pub const REMOTE: usize = 1;
/// Exactly two components: local and remote. A hard design constant.
pub const NCOMPONENTS: usize = 2;

/// External operations mirror a gateway request; sync requests are synthetic
/// copies issued by the resynchronizer and complete on their own channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    External { op_id: u64 },
    Sync,
}

impl RequestKind {
    pub fn is_sync(&self) -> bool {
        matches!(self, RequestKind::Sync)
    }
}

/// Operation descriptor, copied in and out under a short lock
#[derive(Debug, Clone, Copy)]
pub struct OpDesc {
    pub kind: RequestKind,
    pub cmd: Command,
    /// Wire sequence, unique across external and sync requests
    pub seq: u64,
    pub offset: u64,
    pub length: u64,
}

impl OpDesc {
    /// Short request description for logging
    pub fn describe(&self) -> String {
        match self.cmd {
            Command::Flush => "FLUSH".to_string(),
            cmd => format!("{}({}, {})", cmd.name(), self.offset, self.length),
        }
    }
}

/// One reusable request record
pub struct IoRequest {
    desc: Mutex<OpDesc>,
    /// Payload buffer, preallocated once; `desc.length` bytes are meaningful
    data: tokio::sync::Mutex<Vec<u8>>,
    /// Per-component outcome, preset to `Invalid` before every dispatch
    errors: [AtomicU8; NCOMPONENTS],
    /// Components still pending; reaching zero completes the request
    countdown: AtomicU32,
}

impl IoRequest {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            desc: Mutex::new(OpDesc {
                kind: RequestKind::Sync,
                cmd: Command::Flush,
                seq: 0,
                offset: 0,
                length: 0,
            }),
            data: tokio::sync::Mutex::new(vec![0u8; buffer_size]),
            errors: [AtomicU8::new(OpStatus::Invalid as u8), AtomicU8::new(OpStatus::Invalid as u8)],
            countdown: AtomicU32::new(0),
        }
    }

    pub fn desc(&self) -> OpDesc {
        *self.desc.lock().unwrap()
    }

    /// Populate the descriptor and preset every error slot to the
    /// "not yet attempted" sentinel. Only called while the request is
    /// exclusively owned (freshly acquired, or parked by the resynchronizer).
    pub fn populate(&self, desc: OpDesc) {
        *self.desc.lock().unwrap() = desc;
        for slot in &self.errors {
            slot.store(OpStatus::Invalid as u8, Ordering::Release);
        }
    }

    pub fn data(&self) -> &tokio::sync::Mutex<Vec<u8>> {
        &self.data
    }

    pub fn set_error(&self, component: usize, status: OpStatus) {
        self.errors[component].store(status as u8, Ordering::Release);
    }

    pub fn error(&self, component: usize) -> OpStatus {
        OpStatus::from_u8(self.errors[component].load(Ordering::Acquire))
    }

    /// Arm the join countdown before dispatch
    pub fn arm(&self, components: u32) {
        self.countdown.store(components, Ordering::Release);
    }

    /// One component finished; true when this was the last one
    pub fn complete_one(&self) -> bool {
        let previous = self.countdown.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "request countdown went negative");
        previous == 1
    }

    /// Aggregate the per-component outcomes: success if at least one
    /// component succeeded, otherwise the first component's error.
    pub fn aggregate(&self) -> OpStatus {
        for component in 0..NCOMPONENTS {
            if self.error(component).is_ok() {
                return OpStatus::Ok;
            }
        }
        self.error(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(cmd: Command) -> OpDesc {
        OpDesc {
            kind: RequestKind::External { op_id: 1 },
            cmd,
            seq: 1,
            offset: 0,
            length: 512,
        }
    }

    #[test]
    fn test_populate_presets_errors() {
        let req = IoRequest::new(1024);
        req.set_error(LOCAL, OpStatus::Ok);
        req.populate(desc(Command::Write));
        assert_eq!(req.error(LOCAL), OpStatus::Invalid);
        assert_eq!(req.error(REMOTE), OpStatus::Invalid);
    }

    #[test]
    fn test_countdown_completes_once() {
        let req = IoRequest::new(1024);
        req.arm(2);
        assert!(!req.complete_one());
        assert!(req.complete_one());
    }

    #[test]
    fn test_aggregate_one_success_is_enough() {
        let req = IoRequest::new(1024);
        req.populate(desc(Command::Write));
        req.set_error(LOCAL, OpStatus::Ok);
        req.set_error(REMOTE, OpStatus::NotConnected);
        assert_eq!(req.aggregate(), OpStatus::Ok);
    }

    #[test]
    fn test_aggregate_all_failed_surfaces_first() {
        let req = IoRequest::new(1024);
        req.populate(desc(Command::Write));
        req.set_error(LOCAL, OpStatus::IoError);
        req.set_error(REMOTE, OpStatus::NotConnected);
        assert_eq!(req.aggregate(), OpStatus::IoError);
    }
}
