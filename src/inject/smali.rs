//! Line-level edits of smali class files.
//!
//! Edits only ever add lines; every existing line (and therefore every label
//! and instruction of the method) is carried through byte for byte.

use std::ops::Range;

#[derive(Debug, PartialEq, Eq)]
pub enum Insertion {
    /// New file content with the call added.
    Inserted(String),
    /// The method already calls the target; nothing to do.
    AlreadyPresent,
}

#[derive(Debug, PartialEq, Eq)]
pub enum InsertError {
    MethodNotFound,
    /// Abstract or native method.
    NoBody,
}

/// Line range of the method whose `.method` directive ends with `signature`,
/// from the directive up to and including `.end method`.
pub fn find_method(lines: &[&str], signature: &str) -> Option<Range<usize>> {
    let start = lines.iter().position(|line| {
        line.trim()
            .strip_prefix(".method ")
            .and_then(|rest| rest.split_whitespace().last())
            == Some(signature)
    })?;
    let end = lines[start..]
        .iter()
        .position(|line| line.trim() == ".end method")
        .map(|offset| start + offset)?;
    Some(start..end + 1)
}

/// Inserts `statement` as the first instruction of `method`.
///
/// `call_target` (e.g. `Lcom/payload/Init;->init()V`) identifies an existing
/// call site so repeated patching inserts it only once.
pub fn insert_first_instruction(
    source: &str,
    method: &str,
    statement: &str,
    call_target: &str,
) -> Result<Insertion, InsertError> {
    let lines: Vec<&str> = source.split_inclusive('\n').collect();
    let range = find_method(&lines, method).ok_or(InsertError::MethodNotFound)?;
    let body = &lines[range.start + 1..range.end - 1];

    let already = body.iter().any(|line| {
        let line = line.trim();
        line.starts_with("invoke-static") && line.contains(call_target)
    });
    if already {
        return Ok(Insertion::AlreadyPresent);
    }

    let has_registers = body.iter().any(|line| {
        let line = line.trim_start();
        line.starts_with(".locals") || line.starts_with(".registers")
    });
    if !has_registers {
        return Err(InsertError::NoBody);
    }

    let at = range.start + 1 + preamble_len(body);
    let newline = if source.contains("\r\n") { "\r\n" } else { "\n" };

    let mut out = String::with_capacity(source.len() + statement.len() + 8);
    for line in &lines[..at] {
        out.push_str(line);
    }
    if !out.ends_with('\n') {
        out.push_str(newline);
    }
    out.push_str("    ");
    out.push_str(statement);
    out.push_str(newline);
    out.push_str(newline);
    for line in &lines[at..] {
        out.push_str(line);
    }
    Ok(Insertion::Inserted(out))
}

/// Number of leading body lines that are directives rather than code:
/// register counts, parameter and annotation blocks, `.prologue`, blanks.
fn preamble_len(body: &[&str]) -> usize {
    let mut i = 0;
    let mut in_annotation = false;
    while i < body.len() {
        let line = body[i].trim();
        if in_annotation {
            if line == ".end annotation" {
                in_annotation = false;
            }
            i += 1;
            continue;
        }
        let skip = line.is_empty()
            || line.starts_with(".locals")
            || line.starts_with(".registers")
            || line.starts_with(".param")
            || line == ".end param"
            || line == ".prologue";
        if line.starts_with(".annotation") {
            in_annotation = true;
        } else if !skip {
            break;
        }
        i += 1;
    }
    // Back up over trailing blank lines so the call sits right after the
    // last directive.
    while i > 0 && body[i - 1].trim().is_empty() {
        i -= 1;
    }
    i
}
