//! Native code backends. A unit handed to a backend is compiled as a whole
//! and stays resident until its tracker is removed.

mod cranelift;
#[cfg(feature = "llvm")]
mod mcjit;
mod symbols;

use crate::error::{Error, ErrorKind};
use crate::ir::Module;
use std::marker::PhantomData;
use std::mem;

pub(crate) use self::cranelift::CraneliftJit;
#[cfg(feature = "llvm")]
pub(crate) use self::mcjit::McJit;

#[cfg(not(feature = "llvm"))]
pub(crate) type NativeJit = CraneliftJit;
#[cfg(feature = "llvm")]
pub(crate) type NativeJit = McJit;

/// Handle to one resident unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ResourceTracker(u64);

impl ResourceTracker {
    pub(crate) fn new(id: u64) -> Self {
        ResourceTracker(id)
    }
}

/// A compiled function inside a resident unit. Borrowing the backend keeps
/// the unit from being removed while the symbol is alive.
#[derive(Debug, Clone, Copy)]
pub(crate) struct JitSymbol<'j> {
    addr: *const u8,
    arity: usize,
    _unit: PhantomData<&'j ()>,
}

impl<'j> JitSymbol<'j> {
    pub(crate) fn new(addr: *const u8, arity: usize) -> Self {
        JitSymbol {
            addr,
            arity,
            _unit: PhantomData,
        }
    }

    /// Runs a nullary function and returns its result.
    pub(crate) fn call0(&self) -> Result<f64, Error> {
        if self.addr.is_null() || self.arity != 0 {
            return Err(Error::from(ErrorKind::Execution(format!(
                "expected a nullary function, found one taking {} argument(s)",
                self.arity
            ))));
        }
        // The unit is resident for 'j and every generated function uses the
        // platform C calling convention.
        let f: extern "C" fn() -> f64 = unsafe { mem::transmute(self.addr) };
        Ok(f())
    }
}

pub(crate) trait Jit {
    /// Compiles `module`, taking ownership of it.
    fn add_module(&mut self, module: Module) -> Result<ResourceTracker, Error>;

    /// The body of `name` as the backend's optimizer leaves it, printed in
    /// the backend's own IR. `module` only supplies declarations of the
    /// callees; nothing is loaded.
    fn optimized_ir(&self, module: &Module, name: &str) -> Result<String, Error>;

    fn lookup(&self, tracker: ResourceTracker, name: &str) -> Result<JitSymbol<'_>, Error>;

    /// Frees the code of the unit behind `tracker`, and nothing else.
    fn remove(&mut self, tracker: ResourceTracker) -> Result<(), Error>;

    /// Number of units currently resident.
    fn resident(&self) -> usize;
}

fn unknown_tracker(tracker: ResourceTracker) -> Error {
    Error::from(ErrorKind::Execution(format!(
        "no resident unit for tracker {}",
        tracker.0
    )))
}

fn unknown_symbol(name: &str) -> Error {
    Error::from(ErrorKind::Execution(format!(
        "symbol '{}' not found in unit",
        name
    )))
}
