//! Register RPC: the application-facing register table and the handlers that
//! apply request subframes to it.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::reply::ReplyWriter;
use crate::subframe::{Subframe, Values};
use crate::value::{Register, Value, ValueKind};

/// A non-zero status code returned by a register operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
#[error("register error code {0}")]
pub struct RegisterError(pub u32);

/// The application's register table.
///
/// `write` applies a value and `read` returns one in the requested kind.
/// Errors travel back to the client as write-error / read-error subframes.
pub trait RegisterServer {
    fn write(&mut self, register: Register, value: Value) -> Result<(), RegisterError>;
    fn read(&self, register: Register, kind: ValueKind) -> Result<Value, RegisterError>;
}

impl<T: RegisterServer + ?Sized> RegisterServer for &mut T {
    fn write(&mut self, register: Register, value: Value) -> Result<(), RegisterError> {
        (**self).write(register, value)
    }

    fn read(&self, register: Register, kind: ValueKind) -> Result<Value, RegisterError> {
        (**self).read(register, kind)
    }
}

impl<T: RegisterServer + ?Sized> RegisterServer for Box<T> {
    fn write(&mut self, register: Register, value: Value) -> Result<(), RegisterError> {
        (**self).write(register, value)
    }

    fn read(&self, register: Register, kind: ValueKind) -> Result<Value, RegisterError> {
        (**self).read(register, kind)
    }
}

/// A plain in-memory register table.
///
/// Only registers that have been [`define`](Self::define)d exist; values are
/// converted to the requested kind on read.
#[derive(Debug, Clone, Default)]
pub struct RegisterBank {
    values: BTreeMap<Register, Value>,
    read_only: BTreeSet<Register>,
}

impl RegisterBank {
    pub const UNKNOWN_REGISTER: RegisterError = RegisterError(1);
    pub const READ_ONLY: RegisterError = RegisterError(2);

    pub fn new() -> Self {
        Self::default()
    }

    /// Create or overwrite a writable register.
    pub fn define(&mut self, register: Register, value: impl Into<Value>) -> &mut Self {
        self.values.insert(register, value.into());
        self.read_only.remove(&register);
        self
    }

    /// Create or overwrite a register the bus may only read.
    pub fn define_read_only(&mut self, register: Register, value: impl Into<Value>) -> &mut Self {
        self.values.insert(register, value.into());
        self.read_only.insert(register);
        self
    }

    /// Current value, in its stored kind.
    pub fn get(&self, register: Register) -> Option<Value> {
        self.values.get(&register).copied()
    }

    /// Set a value from the application side, bypassing the read-only flag.
    pub fn set(&mut self, register: Register, value: impl Into<Value>) -> bool {
        match self.values.get_mut(&register) {
            Some(slot) => {
                *slot = value.into();
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Register, Value)> + '_ {
        self.values.iter().map(|(register, value)| (*register, *value))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl RegisterServer for RegisterBank {
    fn write(&mut self, register: Register, value: Value) -> Result<(), RegisterError> {
        if self.read_only.contains(&register) {
            return Err(Self::READ_ONLY);
        }
        let slot = self
            .values
            .get_mut(&register)
            .ok_or(Self::UNKNOWN_REGISTER)?;
        *slot = value;
        Ok(())
    }

    fn read(&self, register: Register, kind: ValueKind) -> Result<Value, RegisterError> {
        self.values
            .get(&register)
            .map(|value| value.to_kind(kind))
            .ok_or(Self::UNKNOWN_REGISTER)
    }
}

/// Apply one register request subframe. Non-register subframes are ignored.
pub(crate) fn serve<R: RegisterServer + ?Sized>(
    registers: &mut R,
    subframe: &Subframe<'_>,
    reply: &mut ReplyWriter,
) {
    match *subframe {
        Subframe::WriteSingle { register, value } => write_one(registers, register, value, reply),
        Subframe::WriteMultiple { start, values } => write_run(registers, start, values, reply),
        Subframe::ReadSingle { register, kind } => read_one(registers, register, kind, reply),
        Subframe::ReadMultiple { start, count, kind } => {
            // The parser guarantees the range does not wrap.
            for offset in 0..count {
                read_one(registers, start + offset, kind, reply);
            }
        }
        _ => {}
    }
}

fn write_run<R: RegisterServer + ?Sized>(
    registers: &mut R,
    start: Register,
    values: Values<'_>,
    reply: &mut ReplyWriter,
) {
    for (register, value) in (start..).zip(values) {
        write_one(registers, register, value, reply);
    }
}

fn write_one<R: RegisterServer + ?Sized>(
    registers: &mut R,
    register: Register,
    value: Value,
    reply: &mut ReplyWriter,
) {
    if let Err(RegisterError(code)) = registers.write(register, value) {
        debug!(register, code, "register write refused");
        reply.push(&Subframe::WriteError { register, code });
    }
}

fn read_one<R: RegisterServer + ?Sized>(
    registers: &mut R,
    register: Register,
    kind: ValueKind,
    reply: &mut ReplyWriter,
) {
    match registers.read(register, kind) {
        Ok(value) => reply.push_value(register, value),
        Err(RegisterError(code)) => {
            debug!(register, code, "register read refused");
            reply.push_read_error(register, code);
        }
    }
}
