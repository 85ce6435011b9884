//! Compiled-script classifier.
//!
//! Inspects an extracted script file and estimates the byte format and
//! interpreter generation it was compiled for.  Purely advisory: the
//! verdict annotates listings and summaries and never drives control
//! flow, and every failure path degrades to a lower confidence instead
//! of an error.
//!
//! # Formats
//!
//! | Format | Layout |
//! |--------|--------|
//! | `RPC2` | `RENPY RPC2` magic, then a table of `(slot, start, length)` triples, then slot payloads (zlib) |
//! | `RPC1` | the whole file is one zlib stream |

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use serde::Serialize;

use crate::codec;
use crate::pickle::{self, Value};

/// Magic prefix of the slotted container format.
pub const RPC2_MAGIC: &[u8] = b"RENPY RPC2";

/// Slot tables in the wild have a handful of entries; anything longer
/// means we are walking garbage.
const MAX_SLOTS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScriptFormat {
    #[serde(rename = "RPC1")]
    Rpc1,
    #[serde(rename = "RPC2")]
    Rpc2,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
}

/// The classifier's verdict for one script file.
#[derive(Debug, Clone, Serialize)]
pub struct ScriptReport {
    pub format: ScriptFormat,
    pub python_major: Option<u8>,
    pub renpy_major: Option<u8>,
    pub pickle_protocol: Option<u8>,
    pub confidence: Confidence,
    pub script_version: Option<u64>,
    pub has_init_offset: bool,
    pub notes: Vec<String>,
    /// Human-readable interpreter generation.
    pub label: String,
}

impl ScriptReport {
    fn unknown(notes: Vec<String>) -> Self {
        finish(ScriptReport {
            format: ScriptFormat::Unknown,
            python_major: None,
            renpy_major: None,
            pickle_protocol: None,
            confidence: Confidence::Low,
            script_version: None,
            has_init_offset: false,
            notes,
            label: String::new(),
        })
    }
}

/// Classify one extracted script file.
pub fn classify_script(data: &[u8]) -> ScriptReport {
    if data.is_empty() {
        return ScriptReport::unknown(vec!["empty file".to_owned()]);
    }
    if data.len() >= 12 && data.starts_with(RPC2_MAGIC) {
        return classify_rpc2(data);
    }

    // Pre-container scripts are one zlib stream end to end.  Raw deflate
    // is not tried here: on arbitrary bytes it has false positives, and
    // no RPC1 producer ever skipped the wrapper.
    if let Ok(raw) = codec::inflate_zlib(data) {
        return classify_stream(ScriptFormat::Rpc1, &raw, Vec::new());
    }

    ScriptReport::unknown(vec!["no container magic and not a zlib stream".to_owned()])
}

fn classify_rpc2(data: &[u8]) -> ScriptReport {
    let mut notes = Vec::new();
    let mut slots: Vec<(u32, u32, u32)> = Vec::new();
    let mut cur = Cursor::new(&data[RPC2_MAGIC.len()..]);

    loop {
        let slot = match cur.read_u32::<LittleEndian>() {
            Ok(s) => s,
            Err(_) => {
                notes.push("slot table truncated".to_owned());
                break;
            }
        };
        if slot == 0 {
            break;
        }
        let (start, length) = match (
            cur.read_u32::<LittleEndian>(),
            cur.read_u32::<LittleEndian>(),
        ) {
            (Ok(s), Ok(l)) => (s, l),
            _ => {
                notes.push("slot record truncated".to_owned());
                break;
            }
        };
        slots.push((slot, start, length));
        if slots.len() > MAX_SLOTS {
            notes.push("slot table does not terminate".to_owned());
            break;
        }
    }

    let payload = slots.iter().find(|(slot, _, _)| *slot == 1).and_then(|&(_, start, length)| {
        let start = start as usize;
        let end = start.checked_add(length as usize)?;
        data.get(start..end)
    });

    let slice = match payload {
        Some(s) => s,
        None => {
            notes.push("slot 1 missing or out of bounds".to_owned());
            return classify_stream_failed(ScriptFormat::Rpc2, notes);
        }
    };

    match codec::inflate(slice) {
        Ok(raw) => classify_stream(ScriptFormat::Rpc2, &raw, notes),
        Err(_) => {
            notes.push("slot 1 payload did not decompress".to_owned());
            classify_stream_failed(ScriptFormat::Rpc2, notes)
        }
    }
}

/// Shared tail for a successfully decompressed script stream.
fn classify_stream(format: ScriptFormat, raw: &[u8], mut notes: Vec<String>) -> ScriptReport {
    let pickle_protocol = match raw {
        [0x80, proto, ..] => Some(*proto),
        _ => {
            notes.push("stream does not open with a pickle protocol marker".to_owned());
            None
        }
    };

    let python_major = match format {
        // RPC1 predates the py3 runtime entirely.
        ScriptFormat::Rpc1 => Some(2),
        _ => pickle_protocol.map(|p| if p >= 3 { 3 } else { 2 }),
    };

    let script_version = probe_script_version(raw);

    let renpy_major = match (format, python_major, script_version) {
        (ScriptFormat::Rpc1, _, _) => Some(6),
        (_, Some(3), _) => Some(8),
        (_, Some(2), Some(v)) if v >= 7_000_000 => Some(7),
        (_, Some(2), Some(_)) => Some(6),
        _ => None,
    };

    finish(ScriptReport {
        format,
        python_major,
        renpy_major,
        pickle_protocol,
        confidence: Confidence::Medium,
        script_version,
        has_init_offset: script_version.map(|v| v >= 6_000_000).unwrap_or(false),
        notes,
        label: String::new(),
    })
}

fn classify_stream_failed(format: ScriptFormat, notes: Vec<String>) -> ScriptReport {
    finish(ScriptReport {
        format,
        python_major: None,
        renpy_major: None,
        pickle_protocol: None,
        confidence: Confidence::Low,
        script_version: None,
        has_init_offset: false,
        notes,
        label: String::new(),
    })
}

/// Compiled scripts pickle a `(data, statements)` pair where `data` is a
/// dict carrying a `"version"` int.  Decode failures are expected (the
/// pickle embeds classes this reader refuses) and only mean the version
/// stays unknown.
fn probe_script_version(raw: &[u8]) -> Option<u64> {
    let root = pickle::loads(raw).ok()?;
    let first = root.as_tuple()?.first()?;
    match first {
        Value::Dict(_) => first.dict_get("version")?.as_u64(),
        _ => None,
    }
}

fn finish(mut report: ScriptReport) -> ScriptReport {
    report.label = label_for(&report);
    report
}

fn label_for(report: &ScriptReport) -> String {
    match report.format {
        ScriptFormat::Unknown => "unknown".to_owned(),
        ScriptFormat::Rpc1 => "Ren'Py <= 6.17 legacy".to_owned(),
        ScriptFormat::Rpc2 => match report.python_major {
            Some(3) => "Ren'Py 8.x".to_owned(),
            _ => match report.script_version {
                Some(v) if v >= 7_000_000 => "Ren'Py 7.x".to_owned(),
                Some(v) if v >= 6_000_000 => "Ren'Py 6.99.x".to_owned(),
                Some(v) if v >= 5_000_000 => "Ren'Py 6.18-6.98".to_owned(),
                _ => "Ren'Py 6.x/7.x".to_owned(),
            },
        },
    }
}
