//! Stub dependency synthesis.
//!
//! When a removed dependency still has symbols bound to it, those symbols
//! are repointed at a synthetic stub dylib that supplies stand-in
//! definitions. Orphaned symbols split into two shapes:
//!
//! - `_OBJC_CLASS_$_X` / `_OBJC_METACLASS_$_X` references become an empty
//!   `NSObject` subclass named `X` (one class definition exports both
//!   runtime symbols);
//! - plain C references `_x` become a `void x(void)` body that fails a
//!   non-disableable `assert` naming the symbol, so an accidental call is
//!   loud instead of undefined.
//!
//! Anything else cannot be given a stand-in and is reported as
//! [`Error::UnclassifiableSymbol`].
//!
//! The generated Objective-C source is compiled per architecture with
//! `clang`, with the stub's install name declared at link time so the
//! converted image's new `LC_LOAD_DYLIB` entry resolves to it.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use super::toolchain::run_tool;
use crate::error::{Error, Result};

/// File name of the fused stub library, placed next to the output image.
pub const STUB_BASENAME: &str = "dylibify-stubs.dylib";

const OBJC_CLASS_PREFIX: &str = "_OBJC_CLASS_$_";
const OBJC_METACLASS_PREFIX: &str = "_OBJC_METACLASS_$_";

// =============================================================================
// Classification
// =============================================================================

/// The stand-in shape derived from one orphaned symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubKind {
    /// An Objective-C class (or metaclass) reference; carries the class name.
    Class(String),
    /// A C function reference; carries the unmangled name.
    Function(String),
}

/// Classifies one orphaned symbol.
pub fn classify(symbol: &str) -> Result<StubKind> {
    if let Some(class) = symbol
        .strip_prefix(OBJC_CLASS_PREFIX)
        .or_else(|| symbol.strip_prefix(OBJC_METACLASS_PREFIX))
    {
        if is_c_identifier(class) {
            return Ok(StubKind::Class(class.to_string()));
        }
    } else if let Some(name) = symbol.strip_prefix('_') {
        if is_c_identifier(name) {
            return Ok(StubKind::Function(name.to_string()));
        }
    }
    Err(Error::UnclassifiableSymbol {
        name: symbol.to_string(),
    })
}

fn is_c_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Partitions an orphan set into class and function stand-ins.
///
/// Class and metaclass references to the same class collapse into one entry;
/// the ordered sets keep the generated source deterministic.
pub fn classify_orphans(orphans: &BTreeSet<String>) -> Result<(BTreeSet<String>, BTreeSet<String>)> {
    let mut classes = BTreeSet::new();
    let mut functions = BTreeSet::new();
    for symbol in orphans {
        match classify(symbol)? {
            StubKind::Class(name) => {
                classes.insert(name);
            }
            StubKind::Function(name) => {
                functions.insert(name);
            }
        }
    }
    Ok((classes, functions))
}

// =============================================================================
// Source Generation
// =============================================================================

/// A per-architecture stub compilation request.
#[derive(Debug, Clone)]
pub struct StubRequest {
    /// Architecture the thin stub is compiled for
    pub arch: &'static str,
    /// Rendered Objective-C source
    pub source: String,
}

/// Renders the stub dylib's Objective-C source.
pub fn render_stub_source(classes: &BTreeSet<String>, functions: &BTreeSet<String>) -> String {
    let mut source = String::new();
    source.push_str("#undef NDEBUG\n");
    source.push_str("#include <assert.h>\n");
    source.push_str("#import <Foundation/Foundation.h>\n");

    for class in classes {
        let _ = write!(
            source,
            "\n@interface {class} : NSObject\n@end\n@implementation {class}\n@end\n"
        );
    }

    for function in functions {
        let _ = write!(
            source,
            "\nvoid {function}(void) {{\n    assert(!\"unimplemented symbol '_{function}'\");\n}}\n"
        );
    }

    source
}

/// Derives the stub's install name from the converted image's identity path.
///
/// The stub lives in the same directory the identity declares for the image
/// itself, so loader-relative prefixes (`@executable_path`, `@rpath`) carry
/// over unchanged.
pub fn stub_install_name(identity: &str) -> String {
    match identity.rsplit_once('/') {
        Some((dir, _)) => format!("{dir}/{STUB_BASENAME}"),
        None => STUB_BASENAME.to_string(),
    }
}

// =============================================================================
// Compilation
// =============================================================================

/// Builds the clang argument vector for one thin stub.
pub fn clang_argv(arch: &str, source: &Path, thin: &Path, install_name: &str) -> Vec<String> {
    vec![
        "-arch".to_string(),
        arch.to_string(),
        "-o".to_string(),
        thin.display().to_string(),
        source.display().to_string(),
        "-shared".to_string(),
        "-fobjc-arc".to_string(),
        "-framework".to_string(),
        "Foundation".to_string(),
        format!("-Wl,-install_name,{install_name}"),
    ]
}

/// Writes the request's source next to `output` and compiles it into a thin
/// stub dylib for the request's architecture. Returns the thin artifact's
/// path.
pub fn compile_stub(
    request: &StubRequest,
    output: &Path,
    install_name: &str,
    timeout: Duration,
) -> Result<PathBuf> {
    let source_path = output.with_file_name(format!("dylibify-stubs.{}.m", request.arch));
    let thin_path = output.with_file_name(format!("dylibify-stubs.{}.dylib", request.arch));

    fs::write(&source_path, &request.source).map_err(|source| Error::FileWrite {
        path: source_path.clone(),
        source,
    })?;
    debug!("wrote stub source {}", source_path.display());

    let args = clang_argv(request.arch, &source_path, &thin_path, install_name);
    run_tool("clang", &args, timeout)?;
    Ok(thin_path)
}
