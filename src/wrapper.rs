//! Execution wrapper builder
//!
//! User code is never sent to the engine as-is. It is wrapped in a generated
//! Python program that, inside the engine's own namespace:
//!
//! 1. swaps `sys.stdout` / `sys.stderr` for in-memory buffers and restores
//!    them in a `finally` block,
//! 2. compiles the code as an expression first and falls back to statement
//!    execution when it is not one, so a bare expression reports its value
//!    the way an interactive console does,
//! 3. captures any exception as a formatted traceback,
//! 4. packs `{stdout, stderr, result_repr, error}` as JSON, base64-encodes
//!    it and stores it in the single string cell of a one-row result table;
//!    lone surrogates are backslash-escaped first so the JSON is valid UTF-8,
//! 5. leaves exactly one uniquely named result table behind.
//!
//! The engine's query language delimits string literals with backticks, and
//! the payload is inlined into such a literal. The base64 alphabet contains
//! no backtick and no double quote, so neither the payload nor the embedded
//! source can terminate the literal around it.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use uuid::Uuid;

/// Prefix reserved for result tables; never reported to the host
pub const RESULT_TABLE_PREFIX: &str = "__dh_result_";

/// Column of the result table that holds the encoded payload
pub const RESULT_COLUMN: &str = "data";

/// String-literal delimiter of the engine's query language
pub const QUERY_STRING_QUOTE: char = '`';

const SOURCE_MARKER: &str = "__dh_code = __dh_base64.b64decode(\"";

/// Fresh result table name for one execution
pub fn new_result_name() -> String {
    format!("{}{}", RESULT_TABLE_PREFIX, Uuid::new_v4().simple())
}

/// Whether a namespace name belongs to the runner rather than the user
pub fn is_internal_name(name: &str) -> bool {
    name.starts_with(RESULT_TABLE_PREFIX)
}

/// Build the wrapper program for `code` that stores its outcome in `result_name`
pub fn build_wrapper(code: &str, result_name: &str) -> String {
    let encoded_source = BASE64.encode(code.as_bytes());
    let mut lines: Vec<String> = Vec::with_capacity(64);

    lines.push("import io as __dh_io".into());
    lines.push("import sys as __dh_sys".into());
    lines.push("import json as __dh_json".into());
    lines.push("import base64 as __dh_base64".into());
    lines.push("import traceback as __dh_tb".into());
    lines.push(String::new());
    lines.push(format!("{SOURCE_MARKER}{encoded_source}\").decode(\"utf-8\")"));
    lines.push("__dh_stdout_buf = __dh_io.StringIO()".into());
    lines.push("__dh_stderr_buf = __dh_io.StringIO()".into());
    lines.push("__dh_orig_stdout = __dh_sys.stdout".into());
    lines.push("__dh_orig_stderr = __dh_sys.stderr".into());
    lines.push("__dh_result = None".into());
    lines.push("__dh_error = None".into());
    lines.push("__dh_sys.stdout = __dh_stdout_buf".into());
    lines.push("__dh_sys.stderr = __dh_stderr_buf".into());
    lines.push(String::new());
    lines.push("try:".into());
    lines.push("    try:".into());
    lines.push("        __dh_compiled = compile(__dh_code, \"<input>\", \"eval\")".into());
    lines.push("    except SyntaxError:".into());
    lines.push("        __dh_compiled = None".into());
    lines.push("    if __dh_compiled is not None:".into());
    lines.push("        __dh_result = eval(__dh_compiled, globals())".into());
    lines.push("    else:".into());
    lines.push("        exec(compile(__dh_code, \"<input>\", \"exec\"), globals())".into());
    lines.push("except Exception:".into());
    lines.push("    __dh_error = __dh_tb.format_exc()".into());
    lines.push("finally:".into());
    lines.push("    __dh_sys.stdout = __dh_orig_stdout".into());
    lines.push("    __dh_sys.stderr = __dh_orig_stderr".into());
    lines.push(String::new());
    lines.push("try:".into());
    lines.push("    __dh_repr = repr(__dh_result) if __dh_result is not None else None".into());
    lines.push("except Exception:".into());
    lines.push("    __dh_repr = None".into());
    lines.push("    __dh_error = __dh_tb.format_exc()".into());
    lines.push(String::new());
    lines.push("def __dh_text(value):".into());
    lines.push("    if value is None:".into());
    lines.push("        return None".into());
    lines.push("    return value.encode(\"utf-8\", \"backslashreplace\").decode(\"utf-8\")".into());
    lines.push(String::new());
    lines.push("__dh_payload = __dh_base64.b64encode(__dh_json.dumps({".into());
    lines.push("    \"stdout\": __dh_text(__dh_stdout_buf.getvalue()),".into());
    lines.push("    \"stderr\": __dh_text(__dh_stderr_buf.getvalue()),".into());
    lines.push("    \"result_repr\": __dh_text(__dh_repr),".into());
    lines.push("    \"error\": __dh_text(__dh_error),".into());
    lines.push("}).encode(\"utf-8\")).decode(\"ascii\")".into());
    lines.push(String::new());
    lines.push("from deephaven import empty_table as __dh_empty_table".into());
    lines.push(format!(
        "{result_name} = __dh_empty_table(1).update([f\"{RESULT_COLUMN} = {q}{{__dh_payload}}{q}\"])",
        q = QUERY_STRING_QUOTE
    ));
    lines.push(String::new());
    lines.push("del __dh_io, __dh_sys, __dh_json, __dh_base64, __dh_tb, __dh_code".into());
    lines.push("del __dh_stdout_buf, __dh_stderr_buf, __dh_orig_stdout, __dh_orig_stderr".into());
    lines.push("del __dh_result, __dh_error, __dh_compiled, __dh_repr, __dh_payload, __dh_empty_table, __dh_text".into());

    lines.join("\n")
}

/// Script that removes a result table, tolerating its absence
pub fn cleanup_script(result_name: &str) -> String {
    format!("try:\n    del {result_name}\nexcept NameError:\n    pass\n")
}

/// Recover the user source embedded in a wrapper program
pub fn embedded_source(program: &str) -> Option<String> {
    let start = program.find(SOURCE_MARKER)? + SOURCE_MARKER.len();
    let rest = &program[start..];
    let end = rest.find('"')?;
    let bytes = BASE64.decode(&rest[..end]).ok()?;
    String::from_utf8(bytes).ok()
}

/// Name of the result table a wrapper program writes to
pub fn result_name_of(program: &str) -> Option<&str> {
    program
        .lines()
        .find(|line| line.starts_with(RESULT_TABLE_PREFIX))
        .and_then(|line| line.split(" = ").next())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_names_are_unique_and_internal() {
        let a = new_result_name();
        let b = new_result_name();
        assert_ne!(a, b);
        assert!(is_internal_name(&a));
        assert!(!is_internal_name("trades"));
    }

    #[test]
    fn test_source_survives_quotes_and_newlines() {
        let code = "s = \"a`b'c\"\nprint(s)\n# naïve `tick`\n";
        let program = build_wrapper(code, "__dh_result_x");
        assert_eq!(embedded_source(&program).as_deref(), Some(code));
    }

    #[test]
    fn test_user_code_never_appears_verbatim() {
        let program = build_wrapper("print('`oops`')", "__dh_result_x");
        assert!(!program.contains("oops"));
    }

    #[test]
    fn test_result_table_line() {
        let program = build_wrapper("1", "__dh_result_abc");
        assert_eq!(result_name_of(&program), Some("__dh_result_abc"));
        assert!(program.contains(
            "__dh_result_abc = __dh_empty_table(1).update([f\"data = `{__dh_payload}`\"])"
        ));
    }

    #[test]
    fn test_streams_restored_in_finally() {
        let program = build_wrapper("x = 1", "__dh_result_abc");
        let finally_at = program.find("finally:").unwrap();
        let restore_at = program.find("    __dh_sys.stdout = __dh_orig_stdout").unwrap();
        let capture_at = program.find("__dh_sys.stdout = __dh_stdout_buf").unwrap();
        assert!(capture_at < finally_at);
        assert!(finally_at < restore_at);
    }

    #[test]
    fn test_eval_is_tried_before_exec() {
        let program = build_wrapper("x = 1", "__dh_result_abc");
        let eval_at = program.find("\"eval\")").unwrap();
        let exec_at = program.find("\"exec\")").unwrap();
        assert!(eval_at < exec_at);
    }

    #[test]
    fn test_every_payload_field_is_made_valid_utf8() {
        let program = build_wrapper("print('x')", "__dh_result_abc");
        assert!(program.contains("\"backslashreplace\""));
        for field in [
            "__dh_text(__dh_stdout_buf.getvalue())",
            "__dh_text(__dh_stderr_buf.getvalue())",
            "__dh_text(__dh_repr)",
            "__dh_text(__dh_error)",
        ] {
            assert!(program.contains(field), "{field} is not sanitised");
        }
        let payload_at = program.find("__dh_payload = ").unwrap();
        assert!(program.find("def __dh_text").unwrap() < payload_at);
        assert!(program.trim_end().ends_with("__dh_text"));
    }

    #[test]
    fn test_cleanup_script_tolerates_missing_name() {
        let script = cleanup_script("__dh_result_abc");
        assert!(script.contains("del __dh_result_abc"));
        assert!(script.contains("except NameError"));
    }
}
