//! Module Lifecycle Manager
//!
//! Owns the single loaded-module instance and guards call ordering:
//! `load` and `unload` are exclusive administrative transitions, `sign` is
//! only valid while the module is Ready. The manager is plain owned state:
//! callers share it behind an `Arc`; nothing here is ambient or global.

use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, error, info};

use super::invoker::{CallContract, CallTarget, NativeInvoker, NativeTarget, SignOutput};
use super::offset::compute_target;
use super::resolver::{LibraryResolver, LibrarySpec, ResolvedLibrary};
use super::{BridgeError, BridgeResult, DEFAULT_CALL_TIMEOUT};

/// Lifecycle states. `Loading` and `Unloading` exist only while the
/// transition lock is held; observers see either `Uninitialized` or
/// `Ready`, never a partially constructed module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    /// No module loaded; `sign` is rejected.
    Uninitialized,
    /// Resolver and calculator are running.
    Loading,
    /// Fully loaded; `sign` is accepted.
    Ready,
    /// Handles are being released.
    Unloading,
}

/// Already-parsed configuration the bridge consumes.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Ordered library candidates; the first that resolves supplies the
    /// offset base, the rest are auxiliary.
    pub libs: Vec<LibrarySpec>,
    /// Signed distance from the base address to the entry point, already
    /// evaluated from the configured expression.
    pub offset: i64,
    /// Output-buffer marshalling contract.
    pub contract: CallContract,
    /// Bound on waiting for the foreign-call lock.
    pub call_timeout: Duration,
}

impl BridgeConfig {
    /// Config with the default contract and timeout.
    pub fn new(libs: Vec<LibrarySpec>, offset: i64) -> Self {
        Self {
            libs,
            offset,
            contract: CallContract::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

/// Everything that exists only between `load` and `unload`. Dropping it
/// releases the library handles the resolver acquired.
struct LoadedModule {
    // Held for RAII: handles keep the mapped images (and the computed
    // target address) valid while Ready.
    _libraries: Vec<ResolvedLibrary>,
    target_address: Option<usize>,
    invoker: NativeInvoker,
}

struct Inner {
    state: ModuleState,
    module: Option<LoadedModule>,
}

/// The bridge facade handed to the API layer.
pub struct SignModule {
    config: BridgeConfig,
    resolver: LibraryResolver,
    inner: RwLock<Inner>,
}

impl SignModule {
    /// Create an uninitialized module for the given configuration.
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            resolver: LibraryResolver::new(),
            inner: RwLock::new(Inner {
                state: ModuleState::Uninitialized,
                module: None,
            }),
        }
    }

    /// Create a module that is immediately Ready, signing through the given
    /// target instead of a resolved native address.
    ///
    /// This is the substitution seam for integration stubs and for
    /// validating a marshalling contract against a candidate callable.
    pub fn with_target(
        config: BridgeConfig,
        target: Box<dyn CallTarget>,
    ) -> BridgeResult<Self> {
        let invoker = NativeInvoker::new(target, config.contract, config.call_timeout)?;
        Ok(Self {
            config,
            resolver: LibraryResolver::new(),
            inner: RwLock::new(Inner {
                state: ModuleState::Ready,
                module: Some(LoadedModule {
                    _libraries: Vec::new(),
                    target_address: None,
                    invoker,
                }),
            }),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ModuleState {
        self.inner.read().state
    }

    /// Absolute address of the loaded entry point, when native.
    pub fn target_address(&self) -> Option<usize> {
        self.inner.read().module.as_ref().and_then(|m| m.target_address)
    }

    /// Resolve libraries, compute the target address, and become Ready.
    ///
    /// Any failure reverts to Uninitialized and is fatal for startup: the
    /// caller must not serve traffic. Loading an already-Ready module is a
    /// no-op.
    pub fn load(&self) -> BridgeResult<()> {
        let mut inner = self.inner.write();
        if inner.state == ModuleState::Ready {
            debug!("load requested but module is already ready");
            return Ok(());
        }

        inner.state = ModuleState::Loading;
        match self.load_inner() {
            Ok(module) => {
                info!(
                    libraries = module._libraries.len(),
                    "sign module loaded, target {:#x}",
                    module.target_address.unwrap_or(0)
                );
                inner.module = Some(module);
                inner.state = ModuleState::Ready;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "sign module failed to load");
                inner.module = None;
                inner.state = ModuleState::Uninitialized;
                Err(e)
            }
        }
    }

    fn load_inner(&self) -> BridgeResult<LoadedModule> {
        let libraries = self.resolver.resolve_all(&self.config.libs)?;
        let primary = &libraries[0];
        let address = compute_target(primary.base(), self.config.offset, primary.region())?;
        debug!(
            library = %primary.spec(),
            "computed target address {:#x} (base {:#x})",
            address,
            primary.base()
        );

        // Safety: `address` was computed from the resolved image's base and
        // validated against its mapped region where available; the handles
        // in `libraries` keep that image mapped for the invoker's lifetime.
        let target = unsafe { NativeTarget::from_address(address) };
        let invoker =
            NativeInvoker::new(Box::new(target), self.config.contract, self.config.call_timeout)?;

        Ok(LoadedModule {
            _libraries: libraries,
            target_address: Some(address),
            invoker,
        })
    }

    /// Perform one sign call. Valid only while Ready; concurrent callers
    /// share the read lock and serialize at the invoker's call gate.
    pub fn sign(&self, cmd: &str, payload: &[u8], seq: u32) -> BridgeResult<SignOutput> {
        let inner = self.inner.read();
        match (&inner.state, &inner.module) {
            (ModuleState::Ready, Some(module)) => module.invoker.invoke(cmd, payload, seq),
            _ => Err(BridgeError::NotInitialized),
        }
    }

    /// Release the module and return to Uninitialized. Idempotent: calling
    /// it on an uninitialized module is a no-op.
    pub fn unload(&self) {
        let mut inner = self.inner.write();
        if inner.state != ModuleState::Ready {
            return;
        }
        inner.state = ModuleState::Unloading;
        // Dropping the module closes only the handles the resolver opened
        // itself; resident libraries lose one reference and stay mapped.
        inner.module = None;
        inner.state = ModuleState::Uninitialized;
        info!("sign module unloaded");
    }
}
