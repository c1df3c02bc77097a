//! Pre-compilation audit of guest source.
//!
//! Two jobs, both done before the VM sees the code:
//! - reject sources that name an introspection escape hatch (function globals,
//!   frame and traceback internals, `__subclasses__`, ...). Identifiers and
//!   string literals are both scanned, so `f"{f.__globals__}"` and
//!   `"{0.__globals__}".format(f)` are caught along with `f.__globals__`;
//! - rewrite plain `import name` statements into explicit `__import__` calls
//!   and a trailing bare expression statement into `__result__ = <expr>`.
//!
//! Names assembled at run time are handled by the guarded `getattr` family
//! installed in the sandbox, which consults [`is_denied_attribute`].

use rustpython_parser::{ast, lexer, Mode, Parse, Tok};

use crate::types::{GuestError, Lookup};

/// Guest global that receives the value of a trailing expression.
pub(crate) const RESULT_NAME: &str = "__result__";

/// Names guest code may never mention.
///
/// Besides the direct escape hatches this covers every route to a class's
/// raw attribute table (`__dict__`, the MRO and base links) and descriptor
/// binding (`__get__`), which would otherwise reach the names below by
/// subscripting with strings assembled at run time.
pub const DENIED_ATTRIBUTES: &[&str] = &[
    "__builtins__",
    "__globals__",
    "__subclasses__",
    "__dict__",
    "__get__",
    "__mro__",
    "mro",
    "__base__",
    "__bases__",
    "__code__",
    "__closure__",
    "__getattribute__",
    "__self__",
    "__loader__",
    "__spec__",
    "__reduce__",
    "__reduce_ex__",
    "f_globals",
    "f_locals",
    "f_builtins",
    "f_back",
    "tb_frame",
    "gi_frame",
    "gi_code",
    "cr_frame",
    "cr_code",
    "ag_frame",
    "ag_code",
    "f_code",
];

pub fn is_denied_attribute(name: &str) -> bool {
    DENIED_ATTRIBUTES.contains(&name)
}

/// Guest source that passed (or failed) the audit.
#[derive(Debug, Clone, PartialEq)]
pub struct Prepared {
    /// Source to compile, after [`rewrite`].
    pub source: String,
    /// `Err` if the source mentions a denied name.
    pub verdict: Result<(), GuestError>,
}

/// Audits `source` and rewrites its trailing expression.
pub fn prepare(source: &str) -> Prepared {
    if let Err(e) = scan(source) {
        return Prepared {
            source: source.to_owned(),
            verdict: Err(e),
        };
    }
    Prepared {
        source: rewrite(source),
        verdict: Ok(()),
    }
}

/// Rejects the first token that names a denied attribute.
///
/// Stops quietly at the first lexical error; the compiler reports those with
/// better messages.
pub fn scan(source: &str) -> Result<(), GuestError> {
    for token in lexer::lex(source, Mode::Module) {
        let Ok((tok, range)) = token else {
            break;
        };
        let offset = u32::from(range.start()) as usize;
        let hit = match &tok {
            Tok::Name { name } => is_denied_attribute(name).then(|| name.clone()),
            Tok::String { value, .. } => DENIED_ATTRIBUTES
                .iter()
                .find(|denied| mentions(value, denied))
                .map(|denied| denied.to_string()),
            _ => None,
        };
        if let Some(name) = hit {
            let (line, col) = line_col(source, offset);
            tracing::debug!(%name, line, col, "guest source names a denied attribute");
            return Err(GuestError::CapabilityUnreachable {
                name,
                lookup: Lookup::Attribute,
            });
        }
    }
    Ok(())
}

/// Whether `text` contains `name` as a whole identifier, so `"mro"` is
/// caught in `"{0.mro}"` but not in `"homeroom"`.
fn mentions(text: &str, name: &str) -> bool {
    let is_ident = |c: char| c == '_' || c.is_alphanumeric();
    text.match_indices(name).any(|(at, _)| {
        let before = text[..at].chars().next_back();
        let after = text[at + name.len()..].chars().next();
        !before.is_some_and(is_ident) && !after.is_some_and(is_ident)
    })
}

/// Rewrites accepted source before compilation:
/// - every plain `import a` / `import a as b` becomes an explicit
///   `a = __import__('a')`, so each guest import reaches the import gate
///   (the VM would otherwise serve a bare name straight from `sys.modules`);
/// - a trailing expression statement is bound to `__result__`.
///
/// Returns the source unchanged when it does not parse. Line numbers are
/// preserved.
pub fn rewrite(source: &str) -> String {
    let Ok(suite) = ast::Suite::parse(source, "<guest>") else {
        return source.to_owned();
    };
    let mut edits = Vec::new();
    collect_import_edits(source, &suite, &mut edits);
    if let Some(ast::Stmt::Expr(stmt)) = suite.last() {
        let start = u32::from(stmt.range.start()) as usize;
        edits.push(Edit {
            start,
            end: start,
            text: format!("{RESULT_NAME} = "),
        });
    }
    apply(source, edits)
}

struct Edit {
    start: usize,
    end: usize,
    text: String,
}

fn apply(source: &str, mut edits: Vec<Edit>) -> String {
    edits.sort_by_key(|e| e.start);
    let mut out = String::with_capacity(source.len() + 64);
    let mut cursor = 0;
    for edit in edits {
        let valid = edit.start >= cursor
            && edit.end <= source.len()
            && source.is_char_boundary(edit.start)
            && source.is_char_boundary(edit.end);
        if !valid {
            return source.to_owned();
        }
        out.push_str(&source[cursor..edit.start]);
        out.push_str(&edit.text);
        cursor = edit.end;
    }
    out.push_str(&source[cursor..]);
    out
}

fn collect_import_edits(source: &str, body: &[ast::Stmt], edits: &mut Vec<Edit>) {
    for stmt in body {
        match stmt {
            ast::Stmt::Import(import) => {
                let start = u32::from(import.range.start()) as usize;
                let end = u32::from(import.range.end()) as usize;
                let plain: Option<Vec<(&str, &str)>> = import
                    .names
                    .iter()
                    .map(|alias| {
                        let module = alias.name.as_str();
                        match &alias.asname {
                            Some(asname) => Some((asname.as_str(), module)),
                            // `import a.b` already goes through `__import__`.
                            None if !module.contains('.') => Some((module, module)),
                            None => None,
                        }
                    })
                    .collect();
                let Some(bindings) = plain else {
                    continue;
                };
                let mut text = bindings
                    .iter()
                    .map(|(target, module)| {
                        if module.contains('.') {
                            format!("{target} = __import__('{module}', None, None, ('*',))")
                        } else {
                            format!("{target} = __import__('{module}')")
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("; ");
                let lines = source.get(start..end).map_or(0, |s| s.matches('\n').count());
                for _ in 0..lines {
                    text.push_str(" \\\n");
                }
                edits.push(Edit { start, end, text });
            }
            ast::Stmt::FunctionDef(ast::StmtFunctionDef { body, .. })
            | ast::Stmt::AsyncFunctionDef(ast::StmtAsyncFunctionDef { body, .. })
            | ast::Stmt::ClassDef(ast::StmtClassDef { body, .. })
            | ast::Stmt::With(ast::StmtWith { body, .. })
            | ast::Stmt::AsyncWith(ast::StmtAsyncWith { body, .. }) => {
                collect_import_edits(source, body, edits);
            }
            ast::Stmt::For(ast::StmtFor { body, orelse, .. })
            | ast::Stmt::AsyncFor(ast::StmtAsyncFor { body, orelse, .. })
            | ast::Stmt::While(ast::StmtWhile { body, orelse, .. })
            | ast::Stmt::If(ast::StmtIf { body, orelse, .. }) => {
                collect_import_edits(source, body, edits);
                collect_import_edits(source, orelse, edits);
            }
            ast::Stmt::Try(ast::StmtTry {
                body,
                handlers,
                orelse,
                finalbody,
                ..
            })
            | ast::Stmt::TryStar(ast::StmtTryStar {
                body,
                handlers,
                orelse,
                finalbody,
                ..
            }) => {
                collect_import_edits(source, body, edits);
                for ast::ExceptHandler::ExceptHandler(handler) in handlers {
                    collect_import_edits(source, &handler.body, edits);
                }
                collect_import_edits(source, orelse, edits);
                collect_import_edits(source, finalbody, edits);
            }
            ast::Stmt::Match(ast::StmtMatch { cases, .. }) => {
                for case in cases {
                    collect_import_edits(source, &case.body, edits);
                }
            }
            _ => {}
        }
    }
}

/// 1-based line and column of a byte offset.
fn line_col(source: &str, offset: usize) -> (u32, u32) {
    let before = &source[..offset.min(source.len())];
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map(|i| i + 1).unwrap_or(0);
    let col = before[line_start..].chars().count() + 1;
    (line as u32, col as u32)
}
