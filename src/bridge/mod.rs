//! Dynamic native-call bridge
//!
//! The signing logic lives in a closed, externally supplied native module
//! and is reached by address, not by symbol: a configured offset is added
//! to the base of whichever configured library is actually mapped into the
//! process. This module is everything between the API layer and that
//! foreign entry point.
//!
//! # Architecture
//!
//! ```text
//! API layer (external)
//!       │ sign(cmd, payload, seq)
//!       ▼
//! SignModule ──────── lifecycle: Uninitialized → Ready → Uninitialized
//!       │
//!       ├── LibraryResolver     dlopen / RTLD_NOLOAD, base discovery
//!       ├── OffsetExpr          base + offset → absolute address
//!       └── NativeInvoker       serialized foreign call, buffer copy-out
//!              │
//!              ▼
//!       opaque module (CallTarget)
//! ```
//!
//! The foreign call is treated as a non-reentrant shared resource and a
//! memory-safety boundary: inputs are copied in, outputs are copied out,
//! and a failed call is surfaced as a typed error, never retried.

mod error;
mod invoker;
mod lifecycle;
mod offset;
mod resolver;

pub use error::{BridgeError, BridgeResult};
pub use invoker::{
    CallContract, CallTarget, NativeInvoker, NativeTarget, RawSignFn, SignOutput,
    DEFAULT_CALL_TIMEOUT, DEFAULT_OUT_CAPACITY, DEFAULT_SLOT_SIZE,
};
pub use lifecycle::{BridgeConfig, ModuleState, SignModule};
pub use offset::{compute_target, OffsetExpr, MIN_TARGET_ADDRESS};
pub use resolver::{LibraryResolver, LibrarySpec, ResolvedLibrary};
