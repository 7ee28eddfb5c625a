//! WebAssembly modules for tests, built with `wasm-encoder`.
//!
//! Every defined function has type `() -> i32`, the shape Extism expects of
//! an export, and one `i64` scratch local. Modules from [`guest_module`]
//! also import the Extism kernel and `sy_*` functions in [`HostImport`], so
//! their bodies can pass strings to the host.

use wasm_encoder::{
    BlockType, CodeSection, EntityType, ExportKind, ExportSection, Function, FunctionSection,
    ImportSection, Instruction, MemorySection, MemoryType, Module, TypeSection, ValType,
};

/// Local 0 of every defined function.
const SCRATCH: u32 = 0;

/// Host functions a guest module imports, in function index order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HostImport {
    Alloc,
    StoreU8,
    Length,
    OutputSet,
    Require,
    SetInterval,
    EnvGet,
    StorageGet,
    StorageSet,
}

impl HostImport {
    const ALL: [Self; 9] = [
        Self::Alloc,
        Self::StoreU8,
        Self::Length,
        Self::OutputSet,
        Self::Require,
        Self::SetInterval,
        Self::EnvGet,
        Self::StorageGet,
        Self::StorageSet,
    ];

    fn module(self) -> &'static str {
        match self {
            Self::Alloc | Self::StoreU8 | Self::Length | Self::OutputSet => "extism:host/env",
            _ => "extism:host/user",
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Alloc => "alloc",
            Self::StoreU8 => "store_u8",
            Self::Length => "length",
            Self::OutputSet => "output_set",
            Self::Require => "sy_require",
            Self::SetInterval => "sy_set_interval",
            Self::EnvGet => "sy_env_get",
            Self::StorageGet => "sy_storage_get",
            Self::StorageSet => "sy_storage_set",
        }
    }

    fn signature(self) -> (&'static [ValType], &'static [ValType]) {
        use ValType::{I32, I64};
        match self {
            Self::Alloc | Self::Length | Self::Require | Self::EnvGet | Self::StorageGet => {
                (&[I64], &[I64])
            },
            Self::StoreU8 => (&[I64, I32], &[]),
            Self::OutputSet | Self::StorageSet => (&[I64, I64], &[]),
            Self::SetInterval => (&[I64, I64], &[I64]),
        }
    }

    /// Function index of the import.
    pub(crate) fn index(self) -> u32 {
        (0u32..)
            .zip(Self::ALL)
            .find_map(|(index, import)| (import == self).then_some(index))
            .unwrap()
    }

    /// `call` of this import.
    pub(crate) fn call(self) -> Instruction<'static> {
        Instruction::Call(self.index())
    }
}

/// `i32.const 0`
pub(crate) fn return_zero() -> Vec<Instruction<'static>> {
    vec![Instruction::I32Const(0)]
}

/// `i32.const 1`, a non-zero return Extism reports as a failure.
pub(crate) fn return_one() -> Vec<Instruction<'static>> {
    vec![Instruction::I32Const(1)]
}

/// `loop br 0 end i32.const 0`
pub(crate) fn spin() -> Vec<Instruction<'static>> {
    vec![
        Instruction::Loop(BlockType::Empty),
        Instruction::Br(0),
        Instruction::End,
        Instruction::I32Const(0),
    ]
}

/// Pushes the offset of a fresh Extism memory block holding `s`.
///
/// Only valid in a [`guest_module`].
pub(crate) fn string(s: &str) -> Vec<Instruction<'static>> {
    let mut out = vec![
        Instruction::I64Const(i64::try_from(s.len()).unwrap()),
        HostImport::Alloc.call(),
        Instruction::LocalSet(SCRATCH),
    ];
    for (offset, byte) in (0i64..).zip(s.bytes()) {
        out.extend([
            Instruction::LocalGet(SCRATCH),
            Instruction::I64Const(offset),
            Instruction::I64Add,
            Instruction::I32Const(i32::from(byte)),
            HostImport::StoreU8.call(),
        ]);
    }
    out.push(Instruction::LocalGet(SCRATCH));
    out
}

/// Pops a memory offset and makes that block the call's output.
pub(crate) fn set_output() -> Vec<Instruction<'static>> {
    vec![
        Instruction::LocalSet(SCRATCH),
        Instruction::LocalGet(SCRATCH),
        Instruction::LocalGet(SCRATCH),
        HostImport::Length.call(),
        HostImport::OutputSet.call(),
    ]
}

/// Concatenate instruction sequences.
pub(crate) fn body<I>(parts: I) -> Vec<Instruction<'static>>
where
    I: IntoIterator<Item = Vec<Instruction<'static>>>,
{
    parts.into_iter().flatten().collect()
}

/// An import-free module exporting each `(name, body)` as a function, and
/// optionally a one-page memory under `memory_export`.
pub(crate) fn module(
    functions: &[(&str, Vec<Instruction<'static>>)],
    memory_export: Option<&str>,
) -> Vec<u8> {
    build(false, functions, memory_export)
}

/// A module importing every [`HostImport`] and exporting `functions`.
pub(crate) fn guest_module(functions: &[(&str, Vec<Instruction<'static>>)]) -> Vec<u8> {
    build(true, functions, None)
}

fn build(
    with_imports: bool,
    functions: &[(&str, Vec<Instruction<'static>>)],
    memory_export: Option<&str>,
) -> Vec<u8> {
    let imports: &[HostImport] = if with_imports { &HostImport::ALL } else { &[] };

    // Type 0 is the export shape; import `n` uses type `n + 1`.
    let mut types = TypeSection::new();
    types.ty().function([], [ValType::I32]);
    let mut import_section = ImportSection::new();
    for (type_index, import) in (1u32..).zip(imports) {
        let (params, results) = import.signature();
        types
            .ty()
            .function(params.iter().copied(), results.iter().copied());
        import_section.import(
            import.module(),
            import.name(),
            EntityType::Function(type_index),
        );
    }

    let mut funcs = FunctionSection::new();
    let mut exports = ExportSection::new();
    let mut code = CodeSection::new();
    let first = u32::try_from(imports.len()).unwrap();
    for (index, (name, instructions)) in (first..).zip(functions) {
        funcs.function(0);
        exports.export(name, ExportKind::Func, index);
        let mut function = Function::new([(1, ValType::I64)]);
        for instruction in instructions {
            function.instruction(instruction);
        }
        function.instruction(&Instruction::End);
        code.function(&function);
    }

    let mut module = Module::new();
    module.section(&types);
    if with_imports {
        module.section(&import_section);
    }
    module.section(&funcs);
    if let Some(name) = memory_export {
        let mut memories = MemorySection::new();
        memories.memory(MemoryType {
            minimum: 1,
            maximum: None,
            memory64: false,
            shared: false,
            page_size_log2: None,
        });
        module.section(&memories);
        exports.export(name, ExportKind::Memory, 0);
    }
    module.section(&exports);
    module.section(&code);
    module.finish()
}

/// Exports `on_enable` and `before_task_create`, both returning 0.
pub(crate) fn hooks_module() -> Vec<u8> {
    module(
        &[("on_enable", return_zero()), ("before_task_create", return_zero())],
        None,
    )
}

/// Exports `handle_task`, which never returns.
pub(crate) fn spin_module() -> Vec<u8> {
    module(&[("handle_task", spin())], None)
}

/// Exports that reach the host through `sy_require` and `sy_set_interval`.
///
/// - `require_path` outputs the `path` module descriptor.
/// - `require_process` asks for `process`, which needs a permission.
/// - `schedule` starts a one-minute interval that calls `tick`.
pub(crate) fn host_calls_module() -> Vec<u8> {
    guest_module(&[
        (
            "require_path",
            body([
                string("path"),
                vec![HostImport::Require.call()],
                set_output(),
                return_zero(),
            ]),
        ),
        (
            "require_process",
            body([
                string("process"),
                vec![HostImport::Require.call(), Instruction::Drop],
                return_zero(),
            ]),
        ),
        (
            "schedule",
            body([
                string("tick"),
                vec![
                    Instruction::I64Const(60_000),
                    HostImport::SetInterval.call(),
                    Instruction::Drop,
                ],
                return_zero(),
            ]),
        ),
        ("tick", return_zero()),
    ])
}

/// A component-model preamble.
pub(crate) fn component_header() -> Vec<u8> {
    let mut out = b"\0asm".to_vec();
    out.extend([0x0d, 0x00, 0x01, 0x00]);
    out
}
