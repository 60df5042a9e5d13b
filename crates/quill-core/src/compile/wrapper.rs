//! Wrapper assembly: turns a script snapshot into a compilable cdylib
//! source with a C ABI entry point.
//!
//! The user's source is embedded verbatim so rustc spans stay meaningful;
//! a [`LineMapper`] built during assembly translates them back to the
//! script's own line numbers.

use std::path::PathBuf;
use std::sync::Arc;

use proc_macro2::TokenStream;
use quote::ToTokens;

use crate::workspace::{CompilationUnit, Edition, ParseMode, ScriptId};

use super::diagnostics::LineMapper;

/// Fully assembled wrapper source for one script.
pub struct AssembledSource {
    /// Generated Rust source, ready to hand to rustc.
    pub code: String,

    /// Exported entry symbol, unique per script.
    pub entry_symbol: String,

    /// Maps generated lines back to the script's original lines.
    pub mapper: LineMapper,
}

/// Assembles cdylib wrapper sources.
pub struct WrapperAssembler;

/// Entry symbol exported by the wrapper for a given script.
pub(crate) fn entry_symbol(id: ScriptId) -> String {
    format!("quill_entry_{id}")
}

/// Host bridge compiled into every wrapper. The hook table layout is
/// declared structurally on both sides of the ABI.
const HOOK_MODULE: &str = r#"mod __quill {
    use std::sync::atomic::{AtomicPtr, Ordering};

    #[repr(C)]
    pub struct HostHooks {
        pub context: *mut std::ffi::c_void,
        pub dump: unsafe extern "C" fn(*mut std::ffi::c_void, *const u8, usize),
        pub error: unsafe extern "C" fn(*mut std::ffi::c_void, *const u8, usize),
        pub read_line: unsafe extern "C" fn(*mut std::ffi::c_void, *mut u8, usize) -> isize,
        pub progress: unsafe extern "C" fn(*mut std::ffi::c_void, f64),
    }

    static HOOKS: AtomicPtr<HostHooks> = AtomicPtr::new(std::ptr::null_mut());

    /// # Safety
    /// `hooks` must stay valid until the entry function returns.
    pub unsafe fn install(hooks: *const HostHooks) {
        HOOKS.store(hooks as *mut HostHooks, Ordering::SeqCst);
    }

    fn with_hooks<R>(f: impl FnOnce(&HostHooks) -> R) -> Option<R> {
        let ptr = HOOKS.load(Ordering::SeqCst);
        if ptr.is_null() {
            return None;
        }
        // SAFETY: install() only stores a pointer that outlives the run.
        Some(f(unsafe { &*ptr }))
    }

    /// Show a value using its Debug form. Unit values are not shown.
    pub fn dump<T: std::fmt::Debug>(value: &T) {
        let text = format!("{value:?}");
        if text == "()" {
            return;
        }
        emit(&format!("{text}\n"));
    }

    pub fn emit(text: &str) {
        with_hooks(|h| unsafe { (h.dump)(h.context, text.as_ptr(), text.len()) });
    }

    pub fn emit_error(text: &str) {
        with_hooks(|h| unsafe { (h.error)(h.context, text.as_ptr(), text.len()) });
    }

    /// Read one line of input from the host. Reads are capped at 64 KiB.
    pub fn read_line() -> String {
        with_hooks(|h| {
            let mut buf = vec![0u8; 64 * 1024];
            let n = unsafe { (h.read_line)(h.context, buf.as_mut_ptr(), buf.len()) };
            if n <= 0 {
                return String::new();
            }
            buf.truncate(n as usize);
            String::from_utf8_lossy(&buf).into_owned()
        })
        .unwrap_or_default()
    }

    /// Report progress to the host as a percentage in 0.0..=100.0.
    pub fn report_progress(percent: f64) {
        with_hooks(|h| unsafe { (h.progress)(h.context, percent.clamp(0.0, 100.0)) });
    }
}
"#;

/// Return-type shape of a program's `main`, as far as syntax can tell.
enum MainShape {
    Unit,
    Result,
    Other,
    Missing,
}

impl WrapperAssembler {
    /// Assemble the wrapper source for `unit`.
    ///
    /// `ancestors` are ordered oldest first; their item definitions are
    /// hoisted above the script body. `link_deps` controls whether the
    /// restored dependency crate is linked in.
    pub fn assemble(
        unit: &CompilationUnit,
        ancestors: &[Arc<CompilationUnit>],
        link_deps: bool,
    ) -> AssembledSource {
        let entry_symbol = entry_symbol(unit.id);
        let mut mapper = LineMapper::new(PathBuf::from(format!("script-{}", unit.id)));
        let mut code = String::new();

        code.push_str(&format!("// Generated wrapper for script {}\n", unit.id));
        code.push_str("#![allow(unused_imports)]\n");
        code.push_str("#![allow(dead_code)]\n\n");

        if link_deps {
            code.push_str("extern crate quill_deps;\n");
            code.push_str("use quill_deps::*;\n\n");
        }

        // Glob import so user definitions shadow the helpers instead of
        // colliding with them.
        code.push_str("use crate::__quill::*;\n\n");

        for ancestor in ancestors {
            let items = hoisted_items(ancestor);
            if items.is_empty() {
                continue;
            }
            code.push_str(&format!("// Items carried over from script {}\n", ancestor.id));
            for item in items {
                code.push_str(&item);
                code.push('\n');
            }
            code.push('\n');
        }

        match unit.mode {
            ParseMode::Script => {
                code.push_str("fn __quill_script() -> i32 {\n");
                if ends_with_tail_expr(&unit.source) {
                    code.push_str("    let __quill_result = {\n");
                    push_user_source(&mut code, &unit.source, &mut mapper);
                    code.push_str("    };\n");
                    code.push_str("    crate::__quill::dump(&__quill_result);\n");
                } else {
                    push_user_source(&mut code, &unit.source, &mut mapper);
                }
                code.push_str("    0\n");
                code.push_str("}\n\n");
            }
            ParseMode::Program => {
                push_user_source(&mut code, &unit.source, &mut mapper);
                code.push('\n');
                code.push_str("fn __quill_script() -> i32 {\n");
                match main_shape(&unit.source) {
                    MainShape::Result => {
                        code.push_str("    if let Err(error) = main() {\n");
                        code.push_str(
                            "        crate::__quill::emit_error(&format!(\"Error: {error:?}\\n\"));\n",
                        );
                        code.push_str("        return -2;\n");
                        code.push_str("    }\n");
                    }
                    MainShape::Other => {
                        code.push_str("    let _ = main();\n");
                    }
                    MainShape::Unit | MainShape::Missing => {
                        code.push_str("    main();\n");
                    }
                }
                code.push_str("    0\n");
                code.push_str("}\n\n");
            }
        }

        code.push_str(HOOK_MODULE);
        code.push('\n');
        code.push_str(&Self::entry_fn(unit, &entry_symbol));

        AssembledSource {
            code,
            entry_symbol,
            mapper,
        }
    }

    /// Generate the exported entry function.
    fn entry_fn(unit: &CompilationUnit, entry_symbol: &str) -> String {
        // `#[no_mangle]` became an unsafe attribute in the 2024 edition.
        let no_mangle = match unit.edition {
            Edition::Rust2021 => "#[no_mangle]",
            Edition::Rust2024 => "#[unsafe(no_mangle)]",
        };

        let mut code = String::new();
        code.push_str("/// Entry point invoked by the runner.\n");
        code.push_str("///\n");
        code.push_str("/// # Safety\n");
        code.push_str("/// `hooks` must stay valid for the duration of the call.\n");
        code.push_str(no_mangle);
        code.push('\n');
        code.push_str(&format!(
            "pub unsafe extern \"C\" fn {entry_symbol}(hooks: *const crate::__quill::HostHooks) -> i32 {{\n"
        ));
        code.push_str("    unsafe { crate::__quill::install(hooks) };\n");
        code.push_str(
            "    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(__quill_script));\n",
        );
        code.push_str("    match outcome {\n");
        code.push_str("        Ok(status) => status,\n");
        code.push_str("        Err(payload) => {\n");
        code.push_str("            let message = if let Some(text) = payload.downcast_ref::<&str>() {\n");
        code.push_str("                (*text).to_string()\n");
        code.push_str("            } else if let Some(text) = payload.downcast_ref::<String>() {\n");
        code.push_str("                text.clone()\n");
        code.push_str("            } else {\n");
        code.push_str("                String::from(\"script panicked\")\n");
        code.push_str("            };\n");
        code.push_str("            crate::__quill::emit_error(&format!(\"panic: {message}\\n\"));\n");
        code.push_str("            -4\n");
        code.push_str("        }\n");
        code.push_str("    }\n");
        code.push_str("}\n");
        code
    }
}

/// Embed user source verbatim and record its line anchors.
fn push_user_source(code: &mut String, source: &str, mapper: &mut LineMapper) {
    let start = code.lines().count() + 1;
    let total = source.lines().count().max(1);

    mapper.add_mapping(start, 1);
    if total > 1 {
        mapper.add_mapping(start + total - 1, total);
    }

    code.push_str(source);
    if !source.ends_with('\n') {
        code.push('\n');
    }
}

/// Whether a script-mode source ends in a trailing expression.
///
/// Unparsable sources report `false`; rustc stays the authority on
/// syntax errors.
fn ends_with_tail_expr(source: &str) -> bool {
    match syn::parse_str::<syn::Block>(&format!("{{\n{source}\n}}")) {
        Ok(block) => matches!(block.stmts.last(), Some(syn::Stmt::Expr(_, None))),
        Err(_) => false,
    }
}

/// Return-type shape of `fn main` in a program-mode source.
fn main_shape(source: &str) -> MainShape {
    let Ok(file) = syn::parse_file(source) else {
        return MainShape::Missing;
    };

    for item in &file.items {
        if let syn::Item::Fn(func) = item
            && func.sig.ident == "main"
        {
            return match &func.sig.output {
                syn::ReturnType::Default => MainShape::Unit,
                syn::ReturnType::Type(_, ty) => {
                    if let syn::Type::Path(path) = ty.as_ref()
                        && path.path.segments.last().is_some_and(|s| s.ident == "Result")
                    {
                        MainShape::Result
                    } else {
                        MainShape::Other
                    }
                }
            };
        }
    }

    MainShape::Missing
}

/// Item definitions of an ancestor script, re-printed for hoisting.
///
/// Script-mode ancestors contribute the items of their statement list;
/// program-mode ancestors contribute their file items. `fn main` is
/// never carried over.
fn hoisted_items(unit: &CompilationUnit) -> Vec<String> {
    let items: Vec<syn::Item> = match unit.mode {
        ParseMode::Program => match syn::parse_file(&unit.source) {
            Ok(file) => file.items,
            Err(e) => {
                tracing::debug!("Skipping unparsable ancestor {}: {}", unit.id, e);
                Vec::new()
            }
        },
        ParseMode::Script => match syn::parse_str::<syn::Block>(&format!("{{\n{}\n}}", unit.source))
        {
            Ok(block) => block
                .stmts
                .into_iter()
                .filter_map(|stmt| match stmt {
                    syn::Stmt::Item(item) => Some(item),
                    _ => None,
                })
                .collect(),
            Err(e) => {
                tracing::debug!("Skipping unparsable ancestor {}: {}", unit.id, e);
                Vec::new()
            }
        },
    };

    items
        .into_iter()
        .filter(|item| !matches!(item, syn::Item::Fn(func) if func.sig.ident == "main"))
        .map(|item| {
            let tokens: TokenStream = item.into_token_stream();
            tokens.to_string()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::OpenArgs;

    fn make_unit(id: u64, source: &str, mode: ParseMode) -> CompilationUnit {
        CompilationUnit::from_args(
            ScriptId::from_raw(id),
            OpenArgs::new(source, "/tmp/quill-test").with_mode(mode),
        )
    }

    #[test]
    fn test_script_with_tail_expression_dumps_result() {
        let unit = make_unit(1, "let x = 20;\nx * 2 + 2", ParseMode::Script);
        let assembled = WrapperAssembler::assemble(&unit, &[], false);

        assert_eq!(assembled.entry_symbol, "quill_entry_1");
        assert!(assembled.code.contains("let __quill_result = {"));
        assert!(assembled.code.contains("crate::__quill::dump(&__quill_result);"));
        assert!(assembled.code.contains("x * 2 + 2"));
        assert!(assembled.code.contains("#[unsafe(no_mangle)]"));
    }

    #[test]
    fn test_script_without_tail_expression() {
        let unit = make_unit(1, "let x = 1;\nprintln!(\"{x}\");", ParseMode::Script);
        let assembled = WrapperAssembler::assemble(&unit, &[], false);

        assert!(!assembled.code.contains("__quill_result"));
        assert!(assembled.code.contains("fn __quill_script() -> i32 {"));
    }

    #[test]
    fn test_block_tail_counts_as_expression() {
        let unit = make_unit(1, "if true { 1 } else { 2 }", ParseMode::Script);
        let assembled = WrapperAssembler::assemble(&unit, &[], false);

        assert!(assembled.code.contains("__quill_result"));
    }

    #[test]
    fn test_program_mode_calls_main() {
        let unit = make_unit(
            1,
            "fn main() {\n    println!(\"hello\");\n}",
            ParseMode::Program,
        );
        let assembled = WrapperAssembler::assemble(&unit, &[], false);

        assert!(assembled.code.contains("fn main() {"));
        assert!(assembled.code.contains("    main();\n"));
        assert!(!assembled.code.contains("if let Err"));
    }

    #[test]
    fn test_program_mode_reports_main_error() {
        let unit = make_unit(
            1,
            "fn main() -> Result<(), String> {\n    Err(\"boom\".into())\n}",
            ParseMode::Program,
        );
        let assembled = WrapperAssembler::assemble(&unit, &[], false);

        assert!(assembled.code.contains("if let Err(error) = main()"));
        assert!(assembled.code.contains("return -2;"));
    }

    #[test]
    fn test_edition_2021_uses_plain_no_mangle() {
        let unit = CompilationUnit::from_args(
            ScriptId::from_raw(1),
            OpenArgs::new("1 + 1", "/tmp/quill-test").with_edition(Edition::Rust2021),
        );
        let assembled = WrapperAssembler::assemble(&unit, &[], false);

        assert!(assembled.code.contains("#[no_mangle]"));
        assert!(!assembled.code.contains("#[unsafe(no_mangle)]"));
    }

    #[test]
    fn test_deps_linked_only_when_requested() {
        let unit = make_unit(1, "1 + 1", ParseMode::Script);

        let without = WrapperAssembler::assemble(&unit, &[], false);
        assert!(!without.code.contains("extern crate quill_deps;"));

        let with = WrapperAssembler::assemble(&unit, &[], true);
        assert!(with.code.contains("extern crate quill_deps;"));
        assert!(with.code.contains("use quill_deps::*;"));
    }

    #[test]
    fn test_ancestor_items_are_hoisted() {
        let parent = Arc::new(make_unit(
            1,
            "fn double(x: i32) -> i32 { x * 2 }\nlet seed = 3;\ndouble(seed)",
            ParseMode::Script,
        ));
        let unit = make_unit(2, "double(21)", ParseMode::Script);

        let assembled = WrapperAssembler::assemble(&unit, &[parent], false);

        assert!(assembled.code.contains("Items carried over from script 1"));
        assert!(assembled.code.contains("fn double"));
        // Statements from the ancestor are not carried over.
        assert!(!assembled.code.contains("let seed"));
    }

    #[test]
    fn test_ancestor_main_is_not_hoisted() {
        let parent = Arc::new(make_unit(
            1,
            "fn helper() -> i32 { 7 }\nfn main() { helper(); }",
            ParseMode::Program,
        ));
        let unit = make_unit(2, "helper()", ParseMode::Script);

        let assembled = WrapperAssembler::assemble(&unit, &[parent], false);

        assert!(assembled.code.contains("fn helper"));
        assert!(!assembled.code.contains("fn main"));
    }

    #[test]
    fn test_diagnostics_map_to_original_lines() {
        let unit = make_unit(
            1,
            "let x = 1;\nlet y: i32 = \"oops\";\nx + 1",
            ParseMode::Script,
        );
        let assembled = WrapperAssembler::assemble(&unit, &[], false);

        let generated_line = assembled
            .code
            .lines()
            .position(|l| l.contains("let y: i32"))
            .map(|i| i + 1)
            .unwrap();

        let json = format!(
            r#"{{"message":"mismatched types","code":{{"code":"E0308"}},"level":"error","spans":[{{"file_name":"wrapper.rs","line_start":{generated_line},"line_end":{generated_line},"column_start":14,"column_end":20,"is_primary":true,"label":null}}],"rendered":null}}"#
        );

        let diagnostics = assembled.mapper.parse_rustc_output(&json);
        assert_eq!(diagnostics.len(), 1);
        let location = diagnostics[0].location.as_ref().unwrap();
        assert_eq!(location.line, 2);
        assert_eq!(location.file, PathBuf::from("script-1"));
    }

    #[test]
    fn test_invalid_source_still_assembles() {
        let unit = make_unit(1, "let x = ;", ParseMode::Script);
        let assembled = WrapperAssembler::assemble(&unit, &[], false);

        assert!(assembled.code.contains("let x = ;"));
        assert!(assembled.code.contains("quill_entry_1"));
    }

    /// The generated hook table and [`crate::abi::HostHooks`] describe the
    /// same `#[repr(C)]` layout; field order is the contract.
    #[test]
    fn test_generated_hook_table_matches_abi_layout() {
        let fields = ["context:", "dump:", "error:", "read_line:", "progress:"];
        let mut last = 0;
        for field in fields {
            let at = HOOK_MODULE.find(field).unwrap_or_else(|| {
                panic!("generated hook table is missing the {field} field");
            });
            assert!(at > last, "{field} is out of order in the generated hook table");
            last = at;
        }
        assert!(HOOK_MODULE.contains("#[repr(C)]"));
    }
}
