//! Shared fixtures: an in-process loader whose "libraries" export test
//! registrations through the same C ABI a plugin would use.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;
use tessera_core::{InferShapeContext, IrEdge, IrGraph, IrNode, IrNodeId, IrPort, StorageShape};
use tessera_registry::ffi::{
    self, CountOperatorsFn, ExportOperatorsFn, STATUS_FAILED, Status, TypesToImpl,
};
use tessera_registry::{
    DynamicLoader, Error, LoadedLibrary, LoaderConfig, OpImplRegister, OpImplRegistry,
    OpImplRegistryHolderManager, OppSoBlob, Result, SoInfo,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

// Exported registrations

fn infer_passthrough(ctx: &mut InferShapeContext) -> tessera_core::Result<()> {
    let shape = ctx
        .input_shape(0)
        .cloned()
        .ok_or_else(|| tessera_core::Error::Kernel("missing input 0".into()))?;
    if let Some(out) = ctx.output_shape_mut(0) {
        *out = shape;
    }
    Ok(())
}

/// Registrations for the operators the dependency tests use.
pub fn register_ddit_ops(registry: &OpImplRegistry) {
    OpImplRegister::new("Ddit02")
        .infer_shape(infer_passthrough)
        .inputs_data_dependency(&[0, 2])
        .register_into(registry);
    OpImplRegister::new("Ddit1")
        .infer_shape(infer_passthrough)
        .inputs_data_dependency(&[1])
        .private_attr_with_default("mode", "fast")
        .register_into(registry);
    OpImplRegister::new("Ddit3")
        .tiling_inputs_data_dependency(&[1, 2])
        .register_into(registry);
}

fn primary_exports() -> &'static OpImplRegistry {
    static EXPORTS: OnceLock<OpImplRegistry> = OnceLock::new();
    EXPORTS.get_or_init(|| {
        let registry = OpImplRegistry::new();
        register_ddit_ops(&registry);
        registry
    })
}

fn secondary_exports() -> &'static OpImplRegistry {
    static EXPORTS: OnceLock<OpImplRegistry> = OnceLock::new();
    EXPORTS.get_or_init(|| {
        let registry = OpImplRegistry::new();
        OpImplRegister::new("Ddit02")
            .inputs_data_dependency(&[1])
            .register_into(&registry);
        OpImplRegister::new("Extra").register_into(&registry);
        registry
    })
}

unsafe extern "C" fn count_primary() -> usize {
    ffi::count_registered(primary_exports())
}

unsafe extern "C" fn export_primary(buffer: *mut TypesToImpl, count: usize) -> Status {
    unsafe { ffi::export_registry(primary_exports(), buffer, count) }
}

unsafe extern "C" fn count_secondary() -> usize {
    ffi::count_registered(secondary_exports())
}

unsafe extern "C" fn export_secondary(buffer: *mut TypesToImpl, count: usize) -> Status {
    unsafe { ffi::export_registry(secondary_exports(), buffer, count) }
}

unsafe extern "C" fn count_none() -> usize {
    0
}

unsafe extern "C" fn count_one_too_many() -> usize {
    ffi::count_registered(primary_exports()) + 1
}

unsafe extern "C" fn export_failing(_buffer: *mut TypesToImpl, _count: usize) -> Status {
    STATUS_FAILED
}

// Loader

/// What a mock library does when asked for its exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Primary,
    Secondary,
    NoOperators,
    ExportFails,
    CountMismatch,
    MissingSymbol,
}

/// Loader that never touches the platform loader. Each blob's first byte
/// selects a [`Behavior`].
#[derive(Default)]
pub struct MockLoader {
    opens: AtomicUsize,
    drops: Arc<AtomicUsize>,
    fail_opens: AtomicUsize,
    open_delay: Mutex<Duration>,
    staged: Mutex<Vec<PathBuf>>,
}

impl MockLoader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Libraries closed so far.
    pub fn drops(&self) -> usize {
        self.drops.load(Ordering::SeqCst)
    }

    /// Fail the next `n` opens.
    pub fn fail_next_opens(&self, n: usize) {
        self.fail_opens.store(n, Ordering::SeqCst);
    }

    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock() = delay;
    }

    /// Paths the loader was asked to open.
    pub fn staged_paths(&self) -> Vec<PathBuf> {
        self.staged.lock().clone()
    }
}

impl DynamicLoader for MockLoader {
    fn open(&self, path: &Path) -> Result<Box<dyn LoadedLibrary>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.staged.lock().push(path.to_path_buf());

        let delay = *self.open_delay.lock();
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let failing = self
            .fail_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::OpenFailed {
                name: path.display().to_string(),
                reason: "injected failure".into(),
            });
        }

        let behavior = match fs::read(path)?.first() {
            Some(1) => Behavior::Secondary,
            Some(2) => Behavior::NoOperators,
            Some(3) => Behavior::ExportFails,
            Some(4) => Behavior::CountMismatch,
            Some(5) => Behavior::MissingSymbol,
            _ => Behavior::Primary,
        };
        Ok(Box::new(MockLibrary {
            behavior,
            drops: Arc::clone(&self.drops),
        }))
    }
}

struct MockLibrary {
    behavior: Behavior,
    drops: Arc<AtomicUsize>,
}

impl LoadedLibrary for MockLibrary {
    fn count_operators(&self) -> Result<CountOperatorsFn> {
        let count: CountOperatorsFn = match self.behavior {
            Behavior::Secondary => count_secondary,
            Behavior::NoOperators => count_none,
            Behavior::CountMismatch => count_one_too_many,
            Behavior::MissingSymbol => {
                return Err(Error::SymbolMissing {
                    name: "mock".into(),
                    symbol: "count_operators".into(),
                    reason: "not exported".into(),
                });
            }
            Behavior::Primary | Behavior::ExportFails => count_primary,
        };
        Ok(count)
    }

    fn export_operators(&self) -> Result<ExportOperatorsFn> {
        let export: ExportOperatorsFn = match self.behavior {
            Behavior::Secondary => export_secondary,
            Behavior::ExportFails => export_failing,
            _ => export_primary,
        };
        Ok(export)
    }
}

impl Drop for MockLibrary {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

/// A blob that makes [`MockLoader`] behave as `behavior`.
pub fn blob(name: &str, behavior: Behavior) -> OppSoBlob {
    let tag = match behavior {
        Behavior::Primary => 0u8,
        Behavior::Secondary => 1,
        Behavior::NoOperators => 2,
        Behavior::ExportFails => 3,
        Behavior::CountMismatch => 4,
        Behavior::MissingSymbol => 5,
    };
    OppSoBlob::new(name, vec![tag, 0x7f, b'E', b'L', b'F'])
}

pub fn so_info() -> SoInfo {
    SoInfo::new("x86_64", "linux", "1.0")
}

/// A manager staging into `work_dir`.
pub fn manager(loader: &Arc<MockLoader>, work_dir: &Path) -> OpImplRegistryHolderManager {
    let config = LoaderConfig::with_base_dir(work_dir).work_dir_override(work_dir);
    OpImplRegistryHolderManager::new(Arc::clone(loader) as Arc<dyn DynamicLoader>, config)
}

// Graphs

/// A graph with one `op_type` node reading IR inputs x, y and z.
pub fn xyz_node(op_type: &str) -> (IrGraph, IrNodeId) {
    let mut graph = IrGraph::new();
    let mut node = IrNode::named("node", op_type);
    node.ir_inputs = vec![
        IrPort::required("x"),
        IrPort::required("y"),
        IrPort::required("z"),
    ];
    for name in ["x", "y", "z"] {
        let edge = graph.add_edge(IrEdge::new(
            name,
            tessera_core::DataType::F32,
            StorageShape::uniform(vec![4]),
        ));
        node.add_input(edge);
    }
    let out = graph.add_edge(IrEdge::new(
        "out",
        tessera_core::DataType::F32,
        StorageShape::default(),
    ));
    node.add_output(out);
    let id = graph.add_node(node);
    (graph, id)
}
