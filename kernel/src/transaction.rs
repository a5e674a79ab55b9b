// SPDX-License-Identifier: Apache-2.0
// Copyright Arbor Project Authors

//! Append-only transaction log. Transactional kernels are journaled with a
//! `start` record before execution and an `end` record after; on startup
//! the log is replayed and every unmatched `start` yields a recovered
//! kernel that is executed again.

use crate::buffer::KernelBuffer;
use crate::errors::KernelError;
use crate::kernel::{Kernel, KernelPtr};
use crate::registry::TypeRegistry;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum TransactionStatus {
    Start = 1,
    End = 2,
}

pub struct TransactionLog {
    path: PathBuf,
    file: File,
}

impl TransactionLog {
    /// Replay `path` and reopen it for append. Returns the log together
    /// with the kernels whose `start` record has no matching `end`,
    /// deduplicated by `(application_id, kernel_id)`.
    pub fn open(
        path: &Path,
        types: &TypeRegistry,
    ) -> Result<(Self, Vec<KernelPtr>), KernelError> {
        let recovered = match std::fs::read(path) {
            Ok(bytes) => replay(KernelBuffer::from_vec(bytes), types),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        if !recovered.is_empty() {
            info!(count = recovered.len(), path = %path.display(), "recovered transactional kernels");
        }
        // the recovered kernels are re-journaled by the factory when it
        // re-executes them, so the old log is truncated
        let file = OpenOptions::new().write(true).create(true).truncate(true).open(path)?;
        Ok((Self { path: path.to_path_buf(), file }, recovered))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(
        &mut self,
        status: TransactionStatus,
        type_id: u16,
        k: &dyn Kernel,
    ) -> Result<(), KernelError> {
        let mut record = KernelBuffer::new();
        record.write_u8(status as u8);
        record.write_u64(k.base().id());
        record.write_u16(type_id);
        record.write_u64(k.base().application_id());
        let mut body = KernelBuffer::new();
        k.write(&mut body)?;
        record.write_u32(body.remaining() as u32);
        record.write_bytes(body.as_slice());
        self.file.write_all(record.as_slice())?;
        self.file.flush()?;
        Ok(())
    }
}

fn replay(mut buf: KernelBuffer, types: &TypeRegistry) -> Vec<KernelPtr> {
    let mut open: Vec<((u64, u64), KernelPtr)> = Vec::new();
    loop {
        if buf.is_empty() {
            break;
        }
        let record = match parse_record(&mut buf, types) {
            Ok(record) => record,
            Err(KernelError::UnexpectedEof) => {
                warn!("truncated transaction record at end of log, ignored");
                break;
            }
            Err(e) => {
                warn!(error = %e, "bad transaction record, replay stopped");
                break;
            }
        };
        match record {
            Record::Start { key, kernel } => {
                // duplicate starts are possible after a crash mid-replay;
                // the first one wins
                if !open.iter().any(|(k, _)| *k == key) {
                    open.push((key, kernel));
                }
            }
            Record::End { key } => {
                open.retain(|(k, _)| *k != key);
            }
            Record::Skipped => {}
        }
    }
    open.into_iter().map(|(_, k)| k).collect()
}

enum Record {
    Start { key: (u64, u64), kernel: KernelPtr },
    End { key: (u64, u64) },
    Skipped,
}

fn parse_record(buf: &mut KernelBuffer, types: &TypeRegistry) -> Result<Record, KernelError> {
    let kind = buf.read_u8()?;
    let status = TransactionStatus::from_u8(kind).ok_or(KernelError::BadRecordKind(kind))?;
    let kernel_id = buf.read_u64()?;
    let type_id = buf.read_u16()?;
    let application_id = buf.read_u64()?;
    let body_len = buf.read_u32()? as usize;
    let mut body = KernelBuffer::from_vec(buf.read_bytes(body_len)?);
    let key = (application_id, kernel_id);
    match status {
        TransactionStatus::End => Ok(Record::End { key }),
        TransactionStatus::Start => {
            let Ok(mut kernel) = types.construct(type_id) else {
                warn!(type_id, kernel_id, "unknown kernel type in transaction log, skipped");
                return Ok(Record::Skipped);
            };
            kernel.read(&mut body)?;
            kernel.base_mut().header_mut().set_application_id(application_id);
            // journaled kernels stay journaled when re-executed
            kernel.base_mut().set_flag(crate::flags::KernelFlags::TRANSACTIONAL);
            Ok(Record::Start { key, kernel })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelBase;
    use crate::kernel_base;

    #[derive(Default)]
    struct Job {
        base: KernelBase,
        steps: u32,
    }

    impl Kernel for Job {
        kernel_base!(base);

        fn write(&self, out: &mut KernelBuffer) -> Result<(), KernelError> {
            self.base().write(out);
            out.write_u32(self.steps);
            Ok(())
        }

        fn read(&mut self, buf: &mut KernelBuffer) -> Result<(), KernelError> {
            self.base_mut().read(buf)?;
            self.steps = buf.read_u32()?;
            Ok(())
        }
    }

    fn job(id: u64, steps: u32) -> Job {
        let mut j = Job { steps, ..Default::default() };
        j.base_mut().set_id(id);
        j.base_mut().header_mut().set_application_id(50);
        j
    }

    fn registry() -> TypeRegistry {
        let mut types = TypeRegistry::new();
        types.register::<Job>(7).unwrap();
        types
    }

    #[test]
    fn unmatched_start_is_recovered_once() {
        let path = std::env::temp_dir().join("arbor-txn-recover.log");
        let _ = std::fs::remove_file(&path);
        let types = registry();
        {
            let (mut log, recovered) = TransactionLog::open(&path, &types).unwrap();
            assert!(recovered.is_empty());
            log.write(TransactionStatus::Start, 7, &job(21, 4)).unwrap();
            log.write(TransactionStatus::Start, 7, &job(22, 5)).unwrap();
            log.write(TransactionStatus::End, 7, &job(21, 4)).unwrap();
            // duplicate start must not double-recover
            log.write(TransactionStatus::Start, 7, &job(22, 5)).unwrap();
        }
        let (_log, recovered) = TransactionLog::open(&path, &types).unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].base().id(), 22);
        assert_eq!(recovered[0].base().application_id(), 50);
        let restored = recovered[0].as_any().downcast_ref::<Job>().unwrap();
        assert_eq!(restored.steps, 5);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn truncated_tail_is_tolerated() {
        let path = std::env::temp_dir().join("arbor-txn-truncated.log");
        let _ = std::fs::remove_file(&path);
        let types = registry();
        {
            let (mut log, _) = TransactionLog::open(&path, &types).unwrap();
            log.write(TransactionStatus::Start, 7, &job(31, 1)).unwrap();
        }
        // chop the last record short
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 2]).unwrap();
        let (_log, recovered) = TransactionLog::open(&path, &types).unwrap();
        assert!(recovered.is_empty());
        let _ = std::fs::remove_file(&path);
    }
}
