//! The fixed Python wrapper every snippet runs inside.
//!
//! The snippet is indented into a `with` block that points both stdout and
//! stderr at an in-memory buffer. An exception prints `Error: ...`, and the
//! buffer is flushed to the real stdout in `finally`, so the parent only has
//! to read one stream.

const PRELUDE: &str = "\
import sys
import time
import math
import random
import json
import io
import contextlib

output_buffer = io.StringIO()

try:
    with contextlib.redirect_stdout(output_buffer):
        with contextlib.redirect_stderr(output_buffer):
";

const EPILOGUE: &str = "\
except Exception as e:
    print(f\"Error: {e}\")
finally:
    print(output_buffer.getvalue())
";

/// Indentation of the snippet inside the nested `with` blocks.
const BODY_INDENT: &str = "            ";

/// Returns the complete script for `code`.
pub fn wrap(code: &str) -> String {
    let mut script = String::with_capacity(PRELUDE.len() + code.len() * 2 + EPILOGUE.len());
    script.push_str(PRELUDE);

    if code.trim().is_empty() {
        script.push_str(BODY_INDENT);
        script.push_str("pass\n");
    } else {
        for line in code.lines() {
            script.push_str(BODY_INDENT);
            script.push_str(line);
            script.push('\n');
        }
    }

    script.push_str(EPILOGUE);
    script
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snippet_is_indented_into_body() {
        let script = wrap("x = 1\nprint(x)");
        assert!(script.contains("\n            x = 1\n            print(x)\n"));
        assert!(script.starts_with("import sys\n"));
        assert!(script.ends_with("    print(output_buffer.getvalue())\n"));
    }

    #[test]
    fn test_nested_blocks_keep_relative_indent() {
        let script = wrap("for i in range(2):\n    print(i)");
        assert!(script.contains("            for i in range(2):\n                print(i)\n"));
    }

    #[test]
    fn test_empty_snippet_gets_pass() {
        let script = wrap("  \n");
        assert!(script.contains("redirect_stderr(output_buffer):\n            pass\nexcept"));
    }

    #[test]
    fn test_crlf_lines_are_split() {
        let script = wrap("a = 1\r\nb = 2");
        assert!(script.contains("            a = 1\n            b = 2\n"));
    }
}
