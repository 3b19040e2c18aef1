//! Cross-process sharing of allocations and event pools.
//!
//! An [`IpcHandle`] is a fixed 64-byte little-endian record naming the
//! exporting process, the descriptor of the backing memory object in that
//! process and the object's identity. Importers duplicate the descriptor
//! (`pidfd_getfd` across processes, `dup` within one), check it still refers
//! to the same inode, and map it.
//!
//! ```text
//!  0  magic          4   | 24 object id        8
//!  4  version        2   | 32 size / capacity  8
//!  6  object kind    1   | 40 align / flags    8
//!  7  sub-kind       1   | 48 reserved        12
//!  8  exporter pid   4   | 60 checksum         4
//! 12  exporter fd    4   |
//! 16  backing inode  8   |
//! ```

#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_possible_wrap)]

use crate::error::{UmdError, UmdResult};
use crate::umd::DeviceId;
use crate::umd::context::Context;
use crate::umd::event::{EventPoolFlags, EventPoolHandle, MAX_POOL_CAPACITY};
use crate::umd::memory::manager::ImportKey;
use crate::umd::memory::{Allocation, MemoryKind};
use crate::utils::fnv1a32;
use std::fmt;
use tracing::debug;

pub const IPC_HANDLE_SIZE: usize = 64;

const MAGIC: u32 = 0x4950_554E;
const LAYOUT_VERSION: u16 = 1;
const CHECKSUM_OFFSET: usize = 60;
const RESERVED: std::ops::Range<usize> = 48..60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum ObjectKind {
    Memory = 1,
    EventPool = 2,
}

/// Opaque, copyable token for an exported allocation or event pool.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct IpcHandle([u8; IPC_HANDLE_SIZE]);

impl IpcHandle {
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; IPC_HANDLE_SIZE] {
        &self.0
    }

    /// Wraps bytes received from another process. Nothing is checked until the
    /// handle is opened or put.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; IPC_HANDLE_SIZE]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for IpcHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Descriptor::decode(self) {
            Ok(d) => f
                .debug_struct("IpcHandle")
                .field("kind", &d.kind)
                .field("pid", &d.pid)
                .field("object", &d.object_id)
                .finish(),
            Err(_) => f.write_str("IpcHandle(<malformed>)"),
        }
    }
}

/// Decoded handle contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Descriptor {
    kind: ObjectKind,
    sub_kind: u8,
    pid: u32,
    fd: i32,
    inode: u64,
    object_id: u64,
    size: u64,
    extra: u64,
}

impl Descriptor {
    fn key(&self) -> ImportKey {
        ImportKey {
            pid: self.pid,
            object_id: self.object_id,
        }
    }

    fn encode(&self) -> IpcHandle {
        let mut b = [0u8; IPC_HANDLE_SIZE];
        b[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        b[4..6].copy_from_slice(&LAYOUT_VERSION.to_le_bytes());
        b[6] = self.kind as u8;
        b[7] = self.sub_kind;
        b[8..12].copy_from_slice(&self.pid.to_le_bytes());
        b[12..16].copy_from_slice(&self.fd.to_le_bytes());
        b[16..24].copy_from_slice(&self.inode.to_le_bytes());
        b[24..32].copy_from_slice(&self.object_id.to_le_bytes());
        b[32..40].copy_from_slice(&self.size.to_le_bytes());
        b[40..48].copy_from_slice(&self.extra.to_le_bytes());
        let sum = fnv1a32(&b[..CHECKSUM_OFFSET]);
        b[CHECKSUM_OFFSET..].copy_from_slice(&sum.to_le_bytes());
        IpcHandle(b)
    }

    fn decode(handle: &IpcHandle) -> UmdResult<Self> {
        let b = &handle.0;
        let u16_at = |o: usize| u16::from_le_bytes([b[o], b[o + 1]]);
        let u32_at = |o: usize| u32::from_le_bytes([b[o], b[o + 1], b[o + 2], b[o + 3]]);
        let u64_at = |o: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&b[o..o + 8]);
            u64::from_le_bytes(raw)
        };

        if u32_at(0) != MAGIC {
            return Err(UmdError::invalid_arg("IPC handle has a bad magic"));
        }
        let version = u16_at(4);
        if version != LAYOUT_VERSION {
            return Err(UmdError::invalid_arg(format!("unsupported IPC handle layout {version}")));
        }
        if u32_at(CHECKSUM_OFFSET) != fnv1a32(&b[..CHECKSUM_OFFSET]) {
            return Err(UmdError::invalid_arg("IPC handle checksum mismatch"));
        }
        if b[RESERVED].iter().any(|&x| x != 0) {
            return Err(UmdError::invalid_arg("IPC handle reserved bytes are not zero"));
        }
        let kind = match b[6] {
            1 => ObjectKind::Memory,
            2 => ObjectKind::EventPool,
            other => return Err(UmdError::invalid_arg(format!("unknown IPC object kind {other}"))),
        };
        let fd = u32_at(12) as i32;
        if fd < 0 {
            return Err(UmdError::invalid_arg("IPC handle carries a negative descriptor"));
        }

        Ok(Self {
            kind,
            sub_kind: b[7],
            pid: u32_at(8),
            fd,
            inode: u64_at(16),
            object_id: u64_at(24),
            size: u64_at(32),
            extra: u64_at(40),
        })
    }

    fn decode_as(handle: &IpcHandle, kind: ObjectKind) -> UmdResult<Self> {
        let d = Self::decode(handle)?;
        if d.kind != kind {
            return Err(UmdError::invalid_arg(format!(
                "IPC handle names a {:?}, expected a {kind:?}",
                d.kind
            )));
        }
        Ok(d)
    }
}

// ===============================================================================================
// Public API
// ===============================================================================================

impl Context {
    /// Exports the allocation whose base is `ptr`.
    pub fn get_memory_ipc_handle(&self, ptr: u64) -> UmdResult<IpcHandle> {
        self.api("zeMemGetIpcHandle", || {
            let exp = self.inner.memory.export(ptr)?;
            debug!(id = exp.id.0, base = format_args!("0x{ptr:x}"), "exported allocation");
            Ok(Descriptor {
                kind: ObjectKind::Memory,
                sub_kind: exp.kind.to_wire(),
                pid: std::process::id(),
                fd: exp.fd,
                inode: exp.inode,
                object_id: exp.id.0,
                size: exp.size,
                extra: exp.alignment,
            }
            .encode())
        })
    }

    /// Exporter-side release of one [`get_memory_ipc_handle`](Self::get_memory_ipc_handle).
    pub fn put_memory_ipc_handle(&self, handle: IpcHandle) -> UmdResult<()> {
        self.api("zeMemPutIpcHandle", || {
            let d = Descriptor::decode_as(&handle, ObjectKind::Memory)?;
            if d.pid != std::process::id() {
                return Err(UmdError::invalid_arg("IPC handle was exported by another process"));
            }
            self.inner.memory.put_export(d.object_id)
        })
    }

    /// Maps an exported allocation into this context. Opening the same object
    /// again returns the existing mapping.
    pub fn open_memory_ipc_handle(&self, device: DeviceId, handle: IpcHandle) -> UmdResult<Allocation> {
        self.api("zeMemOpenIpcHandle", || {
            self.device(device)?;
            let d = Descriptor::decode_as(&handle, ObjectKind::Memory)?;
            let kind = MemoryKind::from_wire(d.sub_kind).ok_or_else(|| {
                UmdError::invalid_arg(format!("unknown memory kind {} in IPC handle", d.sub_kind))
            })?;
            if d.size == 0 {
                return Err(UmdError::invalid_arg("IPC handle describes an empty allocation"));
            }
            self.inner
                .memory
                .import(d.key(), d.fd, d.inode, kind, d.size, d.extra, Some(device))
        })
    }

    /// Importer-side release; the last close unmaps.
    pub fn close_memory_ipc_handle(&self, ptr: u64) -> UmdResult<()> {
        self.api("zeMemCloseIpcHandle", || self.inner.memory.close_import(ptr))
    }

    pub fn get_event_pool_ipc_handle(&self, pool: EventPoolHandle) -> UmdResult<IpcHandle> {
        self.api("zeEventPoolGetIpcHandle", || {
            let exp = self.inner.events.export_pool(pool)?;
            debug!(pool = exp.id, capacity = exp.capacity, "exported event pool");
            Ok(Descriptor {
                kind: ObjectKind::EventPool,
                sub_kind: exp.flags.bits() as u8,
                pid: std::process::id(),
                fd: exp.fd,
                inode: exp.inode,
                object_id: exp.id,
                size: u64::from(exp.capacity),
                extra: u64::from(exp.flags.bits()),
            }
            .encode())
        })
    }

    pub fn put_event_pool_ipc_handle(&self, handle: IpcHandle) -> UmdResult<()> {
        self.api("zeEventPoolPutIpcHandle", || {
            let d = Descriptor::decode_as(&handle, ObjectKind::EventPool)?;
            if d.pid != std::process::id() {
                return Err(UmdError::invalid_arg("IPC handle was exported by another process"));
            }
            self.inner.events.put_pool_export(d.object_id)
        })
    }

    pub fn open_event_pool_ipc_handle(&self, handle: IpcHandle) -> UmdResult<EventPoolHandle> {
        self.api("zeEventPoolOpenIpcHandle", || {
            let d = Descriptor::decode_as(&handle, ObjectKind::EventPool)?;
            let flags = u32::try_from(d.extra)
                .ok()
                .and_then(EventPoolFlags::from_bits)
                .ok_or_else(|| UmdError::invalid_arg("IPC handle carries unknown pool flags"))?;
            let capacity = u32::try_from(d.size)
                .ok()
                .filter(|c| (1..=MAX_POOL_CAPACITY).contains(c))
                .ok_or_else(|| UmdError::invalid_arg("IPC handle carries an invalid pool capacity"))?;
            self.inner
                .events
                .import_pool(d.key(), d.fd, d.inode, capacity, flags)
        })
    }

    pub fn close_event_pool_ipc_handle(&self, pool: EventPoolHandle) -> UmdResult<()> {
        self.api("zeEventPoolCloseIpcHandle", || self.inner.events.close_import(pool))
    }
}
