//! The iJson command language: a tiny `set`/`append` mutation log over a
//! single JSON document, plus the compactor that folds a long command
//! history back down to (ideally) one command.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// One command in an iJson command log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Command {
    Set { path: String, value: Json },
    Append { path: String, value: Json },
}

/// Parse newline-delimited JSON commands, skipping (never erroring on) any
/// line that fails to parse — per `SPEC_FULL.md` §7, a malformed command in
/// the log is a local recoverable error.
pub fn parse_commands(data: &[u8]) -> Vec<Command> {
    let text = String::from_utf8_lossy(data);
    let mut out = Vec::new();
    for line in text.split('\n') {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Command>(line) {
            Ok(cmd) => out.push(cmd),
            Err(_) => continue,
        }
    }
    out
}

/// Serialize one command as a single line (including its trailing `\n`).
pub fn encode_command(cmd: &Command) -> Vec<u8> {
    let mut line = serde_json::to_vec(cmd).expect("Command always serializes");
    line.push(b'\n');
    line
}

fn pointer_of(path: &str) -> String {
    if path.is_empty() || path == "/" {
        String::new()
    } else if let Some(stripped) = path.strip_prefix('/') {
        format!("/{}", stripped)
    } else {
        format!("/{}", path)
    }
}

/// Apply `cmd` to `doc` in place. `set` creates any missing intermediate
/// objects along the path; `append` requires the addressed value to be an
/// array (or absent, in which case an empty array is created first).
pub fn apply(doc: &mut Json, cmd: &Command) {
    match cmd {
        Command::Set { path, value } => set_path(doc, &pointer_of(path), value.clone()),
        Command::Append { path, value } => {
            let ptr = pointer_of(path);
            if doc.pointer(&ptr).is_none() {
                set_path(doc, &ptr, Json::Array(Vec::new()));
            }
            if let Some(arr) = doc.pointer_mut(&ptr).and_then(Json::as_array_mut) {
                arr.push(value.clone());
            }
            // addressed value existed but wasn't an array: malformed command, skip.
        }
    }
}

/// Set `doc[pointer] = value`, creating missing object levels as needed.
/// Root (`pointer == ""`) replaces the whole document.
fn set_path(doc: &mut Json, pointer: &str, value: Json) {
    if pointer.is_empty() {
        *doc = value;
        return;
    }
    let segments: Vec<&str> = pointer.trim_start_matches('/').split('/').collect();
    let mut cur = doc;
    for (i, seg) in segments.iter().enumerate() {
        let seg = unescape_segment(seg);
        if !cur.is_object() {
            *cur = Json::Object(Default::default());
        }
        let obj = cur.as_object_mut().unwrap();
        if i == segments.len() - 1 {
            obj.insert(seg, value);
            return;
        }
        cur = obj.entry(seg).or_insert_with(|| Json::Object(Default::default()));
    }
}

fn unescape_segment(seg: &str) -> String {
    seg.replace("~1", "/").replace("~0", "~")
}

/// Replay `commands` against an empty document and return the fully
/// replayed document plus a compacted command log: a single
/// whole-document `set` covering everything up to some point, followed by
/// any trailing commands left uncompacted because folding them in would
/// have required the prefix to be re-replayed beyond `budget` bytes of
/// savings. `budget == 0` always folds the entire history into one `set`.
pub fn compact(commands: &[Command], budget: u64) -> (Json, Vec<Command>) {
    let mut tail_start = commands.len();
    if budget > 0 {
        let mut tail_bytes: u64 = 0;
        for (i, cmd) in commands.iter().enumerate().rev() {
            let len = encode_command(cmd).len() as u64;
            if tail_bytes + len > budget {
                break;
            }
            tail_bytes += len;
            tail_start = i;
        }
    }

    let mut doc = Json::Null;
    for cmd in &commands[..tail_start] {
        apply(&mut doc, cmd);
    }
    let set_cmd = Command::Set { path: String::new(), value: doc.clone() };
    for cmd in &commands[tail_start..] {
        apply(&mut doc, cmd);
    }

    let mut result = Vec::with_capacity(1 + (commands.len() - tail_start));
    result.push(set_cmd);
    result.extend_from_slice(&commands[tail_start..]);
    (doc, result)
}

/// Should this iJson file compact, given its current counters and size
/// (evaluated only when `size_before_append > 0`, per the spec)?
pub fn should_compact(numcmds: u64, incbytes: u64, size_before_append: u64) -> bool {
    if size_before_append == 0 {
        return false;
    }
    let ratio = incbytes as f64 / size_before_append as f64;
    numcmds > 100 || ratio >= 3.0 || (numcmds > 10 && ratio >= 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_root_then_child() {
        let mut doc = Json::Null;
        apply(&mut doc, &Command::Set { path: String::new(), value: json!({"a": 1}) });
        apply(&mut doc, &Command::Set { path: "/b".into(), value: json!(2) });
        assert_eq!(doc, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn append_creates_array() {
        let mut doc = json!({});
        apply(&mut doc, &Command::Append { path: "/items".into(), value: json!("x") });
        apply(&mut doc, &Command::Append { path: "/items".into(), value: json!("y") });
        assert_eq!(doc, json!({"items": ["x", "y"]}));
    }

    #[test]
    fn compact_is_equivalent_to_replay() {
        let cmds = vec![
            Command::Set { path: String::new(), value: json!({"root": true}) },
            Command::Append { path: "/log".into(), value: json!(1) },
            Command::Append { path: "/log".into(), value: json!(2) },
        ];
        let mut replayed = Json::Null;
        for c in &cmds {
            apply(&mut replayed, c);
        }
        let (folded, log) = compact(&cmds, 0);
        assert_eq!(replayed, folded);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn compact_with_budget_keeps_recent_tail_uncompacted() {
        let cmds = vec![
            Command::Set { path: String::new(), value: json!({"root": true}) },
            Command::Append { path: "/log".into(), value: json!(1) },
            Command::Append { path: "/log".into(), value: json!(2) },
        ];
        let tail_len = encode_command(&cmds[2]).len() as u64;
        let (doc, log) = compact(&cmds, tail_len);
        assert_eq!(doc, json!({"root": true, "log": [1, 2]}));
        // only the very last command fits the budget; it stays uncompacted
        // behind the folded `set`.
        assert_eq!(log.len(), 2);
        assert_eq!(log[1], cmds[2]);
    }

    #[test]
    fn malformed_line_is_skipped() {
        let data = b"{\"op\":\"set\",\"path\":\"\",\"value\":1}\nnot json\n{\"op\":\"set\",\"path\":\"/x\",\"value\":2}\n";
        let cmds = parse_commands(data);
        assert_eq!(cmds.len(), 2);
    }

    #[test]
    fn compaction_trigger_thresholds() {
        assert!(!should_compact(5, 0, 0));
        assert!(should_compact(101, 0, 10));
        assert!(should_compact(5, 30, 10));
        assert!(should_compact(11, 10, 10));
        assert!(!should_compact(11, 5, 10));
    }
}
