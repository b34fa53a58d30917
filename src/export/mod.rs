//! Building and serializing pprof profiles.
//!
//! Turns the profilers' per-stack counters into the pprof protobuf
//! form: every frame becomes a Location (expanded into one Line per
//! inlined call, innermost first), functions are deduplicated by their
//! stable name, and values are scaled by the inverse sampling rate.
//! Serialized profiles are gzip-framed, as pprof tooling expects.

pub mod proto;

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::time::{Duration, SystemTime};

use flate2::write::GzEncoder;
use flate2::Compression;
use prost::Message;

use crate::domain::ProfileError;
use crate::listener::{Frame, FunctionIdent};
use crate::profiling::StackTrace;
use crate::symbolization::{Location, Symbolizer};

/// Everything about a profile build besides the samples themselves.
pub struct ProfileMeta<'a> {
    pub start: SystemTime,
    pub duration: Duration,
    /// (type, unit) pairs, one per sample value.
    pub value_types: &'a [(&'a str, &'a str)],
    /// Per-value scaling ratios, usually the inverse sampling rate.
    /// Values are multiplied and rounded. A ratio of 1 is a no-op.
    pub ratios: &'a [f64],
    /// File name recorded on the profile's mapping: the wasm module.
    pub mapping_file: &'a str,
}

/// Interned string table; index 0 is always the empty string.
#[derive(Default)]
struct StringTable {
    strings: Vec<String>,
    index: HashMap<String, i64>,
}

impl StringTable {
    fn new() -> Self {
        let mut t = StringTable::default();
        t.intern("");
        t
    }

    fn intern(&mut self, s: &str) -> i64 {
        if let Some(&i) = self.index.get(s) {
            return i;
        }
        let i = self.strings.len() as i64;
        self.strings.push(s.to_string());
        self.index.insert(s.to_string(), i);
        i
    }
}

#[derive(PartialEq, Eq, Hash)]
struct LocationKey {
    module: std::sync::Arc<str>,
    index: u32,
    name: std::sync::Arc<str>,
    pc: u64,
}

fn location_key(frame: &Frame) -> LocationKey {
    LocationKey {
        module: frame.function.module.clone(),
        index: frame.function.index,
        name: frame.function.name.clone(),
        pc: frame.pc,
    }
}

/// Build a pprof profile from per-stack samples.
///
/// Locations are cached by (module, function index, function name, PC)
/// and functions by stable name across the whole build, so identical
/// frames in different stacks share ids.
pub fn build_profile<'a>(
    symbols: &dyn Symbolizer,
    samples: impl Iterator<Item = (&'a StackTrace, Vec<i64>)>,
    meta: &ProfileMeta<'_>,
) -> proto::Profile {
    let mut strings = StringTable::new();
    let mut profile = proto::Profile {
        time_nanos: meta
            .start
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0),
        duration_nanos: meta.duration.as_nanos() as i64,
        ..Default::default()
    };

    for (typ, unit) in meta.value_types {
        profile.sample_type.push(proto::ValueType {
            r#type: strings.intern(typ),
            unit: strings.intern(unit),
        });
    }

    let mapping_id = 1;
    profile.mapping.push(proto::Mapping {
        id: mapping_id,
        filename: strings.intern(meta.mapping_file),
        has_functions: true,
        ..Default::default()
    });

    let mut locations: HashMap<LocationKey, u64> = HashMap::new();
    let mut functions: HashMap<String, u64> = HashMap::new();

    for (trace, values) in samples {
        let mut location_ids = Vec::with_capacity(trace.len());
        for frame in trace.frames() {
            let key = location_key(frame);
            let id = match locations.get(&key) {
                Some(&id) => id,
                None => {
                    let id = locations.len() as u64 + 1;
                    let lines = lines_for_frame(
                        symbols,
                        frame,
                        &mut strings,
                        &mut functions,
                        &mut profile,
                    );
                    profile.location.push(proto::Location {
                        id,
                        mapping_id,
                        address: location_address(frame),
                        line: lines,
                        ..Default::default()
                    });
                    locations.insert(key, id);
                    id
                }
            };
            location_ids.push(id);
        }

        profile.sample.push(proto::Sample {
            location_id: location_ids,
            value: scale_values(values, meta.ratios),
            ..Default::default()
        });
    }

    profile.string_table = strings.strings;
    profile
}

fn location_address(frame: &Frame) -> u64 {
    match &frame.source {
        Some(hint) => hint.address,
        None => frame.pc,
    }
}

/// Lines for one frame, innermost inlined call first. When the
/// symbolizer has nothing, a single line named after the
/// runtime-provided function is synthesized so the profile never shows
/// bare addresses.
fn lines_for_frame(
    symbols: &dyn Symbolizer,
    frame: &Frame,
    strings: &mut StringTable,
    functions: &mut HashMap<String, u64>,
    profile: &mut proto::Profile,
) -> Vec<proto::Line> {
    let mut resolved = symbols.locations_for(frame);
    if resolved.is_empty() {
        resolved.push(Location::default());
    }

    // Fall back to the runtime's name for the outermost entry when
    // symbolization came up empty-handed.
    if let Some(outer) = resolved.last_mut() {
        if outer.stable_name.is_empty() {
            outer.stable_name = fallback_name(&frame.function);
        }
        if outer.human_name.is_empty() {
            outer.human_name = fallback_name(&frame.function);
        }
    }

    resolved
        .iter()
        .map(|loc| {
            let function_id = function_id(loc, strings, functions, profile);
            proto::Line { function_id, line: loc.line }
        })
        .collect()
}

fn fallback_name(function: &FunctionIdent) -> String {
    if function.name.is_empty() {
        "<unknown>".to_string()
    } else {
        function.name.to_string()
    }
}

fn function_id(
    loc: &Location,
    strings: &mut StringTable,
    functions: &mut HashMap<String, u64>,
    profile: &mut proto::Profile,
) -> u64 {
    if let Some(&id) = functions.get(&loc.stable_name) {
        return id;
    }
    // 0 is reserved by pprof.
    let id = functions.len() as u64 + 1;
    profile.function.push(proto::Function {
        id,
        name: strings.intern(&loc.human_name),
        system_name: strings.intern(&loc.stable_name),
        filename: strings.intern(&loc.file),
        ..Default::default()
    });
    functions.insert(loc.stable_name.clone(), id);
    id
}

fn scale_values(mut values: Vec<i64>, ratios: &[f64]) -> Vec<i64> {
    for (v, &ratio) in values.iter_mut().zip(ratios) {
        if ratio != 1.0 {
            *v = (*v as f64 * ratio).round() as i64;
        }
    }
    values
}

/// Serialize a profile in the format pprof tools consume: a gzip
/// stream wrapping the protobuf encoding.
pub fn encode_profile(profile: &proto::Profile) -> Result<Vec<u8>, ProfileError> {
    let raw = profile.encode_to_vec();
    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(&raw)?;
    Ok(gz.finish()?)
}

/// Write a serialized profile to a file at the given path.
pub fn write_profile(path: &Path, profile: &proto::Profile) -> Result<(), ProfileError> {
    let bytes = encode_profile(profile)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::SourceHint;
    use crate::symbolization::NullSymbolizer;
    use std::sync::Arc;

    fn trace(pcs: &[u64]) -> StackTrace {
        let mut t = StackTrace::default();
        t.fill(pcs.iter().map(|&pc| {
            Frame::new(FunctionIdent::guest("m", &format!("f{pc}"), pc as u32), pc)
        }));
        t
    }

    fn meta<'a>(
        value_types: &'a [(&'a str, &'a str)],
        ratios: &'a [f64],
    ) -> ProfileMeta<'a> {
        ProfileMeta {
            start: SystemTime::UNIX_EPOCH + Duration::from_secs(1000),
            duration: Duration::from_secs(2),
            value_types,
            ratios,
            mapping_file: "app.wasm",
        }
    }

    #[test]
    fn string_table_reserves_empty_at_zero() {
        let mut t = StringTable::new();
        assert_eq!(t.intern(""), 0);
        let a = t.intern("a");
        assert_eq!(t.intern("a"), a);
        assert_ne!(a, 0);
    }

    #[test]
    fn locations_and_functions_are_deduplicated() {
        let t1 = trace(&[1, 2]);
        let t2 = trace(&[3, 2]);
        let samples = vec![(&t1, vec![1i64]), (&t2, vec![2])];
        let profile = build_profile(
            &NullSymbolizer,
            samples.into_iter(),
            &meta(&[("samples", "count")], &[1.0]),
        );

        // Frame pc=2 appears in both stacks but yields one location.
        assert_eq!(profile.location.len(), 3);
        assert_eq!(profile.function.len(), 3);
        assert_eq!(profile.sample.len(), 2);
        assert_eq!(profile.mapping.len(), 1);
        let file_idx = profile.mapping[0].filename as usize;
        assert_eq!(profile.string_table[file_idx], "app.wasm");
    }

    #[test]
    fn synthesized_lines_carry_the_runtime_name() {
        let t = trace(&[7]);
        let samples = vec![(&t, vec![1i64])];
        let profile = build_profile(
            &NullSymbolizer,
            samples.into_iter(),
            &meta(&[("samples", "count")], &[1.0]),
        );
        assert_eq!(profile.location[0].line.len(), 1);
        let f = &profile.function[0];
        assert_eq!(profile.string_table[f.name as usize], "f7");
    }

    #[test]
    fn source_hints_override_the_location_address() {
        let mut t = StackTrace::default();
        let mut frame = Frame::new(FunctionIdent::guest("m", "script.a", 0), 1);
        frame.source =
            Some(SourceHint { file: Arc::from("script.py"), line: 3, address: 0x88 });
        t.fill(std::iter::once(frame));
        let samples = vec![(&t, vec![1i64])];
        let profile = build_profile(
            &crate::symbolization::HintSymbolizer,
            samples.into_iter(),
            &meta(&[("samples", "count")], &[1.0]),
        );
        assert_eq!(profile.location[0].address, 0x88);
        assert_eq!(profile.location[0].line[0].line, 3);
    }

    #[test]
    fn values_scale_per_ratio() {
        assert_eq!(scale_values(vec![3, 10], &[2.0, 1.0]), vec![6, 10]);
        assert_eq!(scale_values(vec![1], &[1.0 / 0.3]), vec![3]);
    }

    #[test]
    fn serialized_profile_round_trips() {
        let t = trace(&[1, 2, 3]);
        let samples = vec![(&t, vec![4i64, 100])];
        let profile = build_profile(
            &NullSymbolizer,
            samples.into_iter(),
            &meta(&[("samples", "count"), ("cpu", "nanoseconds")], &[1.0, 1.0]),
        );

        let bytes = encode_profile(&profile).unwrap();
        let mut gz = flate2::read::GzDecoder::new(&bytes[..]);
        let mut raw = Vec::new();
        std::io::Read::read_to_end(&mut gz, &mut raw).unwrap();
        let decoded = proto::Profile::decode(&raw[..]).unwrap();

        assert_eq!(decoded, profile);
        assert_eq!(decoded.sample[0].value, vec![4, 100]);
        assert_eq!(decoded.sample[0].location_id.len(), 3);
    }
}
