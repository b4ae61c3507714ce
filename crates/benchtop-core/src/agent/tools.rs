//! Local tool registry for assistant-requested actions.
//!
//! The hosted assistant pauses its run and asks the client to resolve tool
//! calls. Function-type calls dispatch by name here; anything else (the
//! hosted retrieval pipeline reports its own pseudo-calls) is acknowledged
//! with a placeholder output so the run can continue.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::backend::ToolCallRequest;

/// A tool call normalized from a `RequiresAction` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

impl ToolCall {
    /// Normalize a wire request. Missing names keep the reported kind so the
    /// registry can fall through to the placeholder path.
    pub fn from_request(request: &ToolCallRequest) -> Self {
        let arguments = request
            .arguments
            .as_deref()
            .map(|raw| {
                serde_json::from_str(raw).unwrap_or_else(|e| {
                    warn!(
                        tool = %request.kind,
                        raw_args = %raw,
                        error = %e,
                        "Failed to parse tool arguments, using empty object"
                    );
                    serde_json::json!({})
                })
            })
            .unwrap_or_else(|| serde_json::json!({}));

        Self {
            id: request.id.clone(),
            name: request.name.clone().unwrap_or_else(|| request.kind.clone()),
            arguments,
        }
    }
}

/// Output reported back to the service for one tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub tool_call_id: String,
    pub output: String,
}

/// Context for local tool execution, owned by the caller.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Fixed record set for the similarity lookup.
    pub materials: Vec<MaterialRecord>,
    /// Candidate-set size before the quality re-sort.
    pub default_top_n: usize,
}

impl Default for ToolContext {
    fn default() -> Self {
        Self {
            materials: builtin_materials(),
            default_top_n: 5,
        }
    }
}

/// One emitter material in the lookup set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterialRecord {
    /// Line-notation structure string.
    pub structure: String,
    pub name: String,
    pub doi: String,
    pub host: String,
    pub emission_wavelength_nm: f64,
    /// Maximum external quantum efficiency as reported in the source, kept
    /// as a string and parsed to numeric only for ranking.
    pub max_eqe: String,
}

/// A record ranked by the similarity lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedMaterial {
    pub similarity: f64,
    pub max_eqe_value: f64,
    #[serde(flatten)]
    pub record: MaterialRecord,
}

/// Execute a tool call and return its output.
///
/// Unresolvable names never error; the run must continue, so they receive a
/// generic acknowledgement.
pub fn execute_tool(call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
    match call.name.as_str() {
        "search_similar_materials" => search_similar_materials(call, ctx),
        _ => {
            debug!(name = %call.name, "No local handler, acknowledging");
            ToolOutput {
                tool_call_id: call.id.clone(),
                output: "acknowledged".to_string(),
            }
        }
    }
}

/// Similarity lookup over the fixed material set.
fn search_similar_materials(call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
    let query = call.arguments["structure"].as_str().unwrap_or("");
    let top_n = call.arguments["top_n"]
        .as_u64()
        .map(|n| n as usize)
        .unwrap_or(ctx.default_top_n);

    info!(query_len = query.len(), top_n, "Running similarity lookup");

    let body = match best_match(query, &ctx.materials, top_n) {
        Some(ranked) => serde_json::json!({ "results": [ranked] }),
        None => serde_json::json!({ "results": [] }),
    };

    ToolOutput {
        tool_call_id: call.id.clone(),
        output: body.to_string(),
    }
}

/// Two-stage ranking over the record set.
///
/// Sort all records by similarity descending, keep the top `top_n`, parse
/// the reported max EQE to a number, re-sort that subset by EQE descending,
/// and keep only the single best record. Both sorts are stable, so repeated
/// calls with identical input are deterministic.
pub fn best_match(
    query: &str,
    materials: &[MaterialRecord],
    top_n: usize,
) -> Option<RankedMaterial> {
    let query_fp = fingerprint(query);

    let mut scored: Vec<(f64, &MaterialRecord)> = materials
        .iter()
        .map(|m| (tanimoto(&query_fp, &fingerprint(&m.structure)), m))
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(top_n);

    let mut by_quality: Vec<(f64, f64, &MaterialRecord)> = scored
        .into_iter()
        .map(|(similarity, m)| (parse_eqe(&m.max_eqe), similarity, m))
        .collect();
    by_quality.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    by_quality
        .into_iter()
        .next()
        .map(|(max_eqe_value, similarity, record)| RankedMaterial {
            similarity,
            max_eqe_value,
            record: record.clone(),
        })
}

fn parse_eqe(reported: &str) -> f64 {
    reported
        .trim()
        .trim_end_matches('%')
        .trim()
        .parse()
        .unwrap_or(0.0)
}

const FP_WORDS: usize = 4;

/// Hashed character-trigram bitset over the structure string.
fn fingerprint(structure: &str) -> [u64; FP_WORDS] {
    let mut bits = [0u64; FP_WORDS];
    let bytes = structure.as_bytes();
    if bytes.is_empty() {
        return bits;
    }

    let window = 3.min(bytes.len());
    for gram in bytes.windows(window) {
        // FNV-1a
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for &b in gram {
            hash ^= b as u64;
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        let bit = (hash % (FP_WORDS as u64 * 64)) as usize;
        bits[bit / 64] |= 1 << (bit % 64);
    }
    bits
}

fn tanimoto(a: &[u64; FP_WORDS], b: &[u64; FP_WORDS]) -> f64 {
    let mut intersection = 0u32;
    let mut union = 0u32;
    for i in 0..FP_WORDS {
        intersection += (a[i] & b[i]).count_ones();
        union += (a[i] | b[i]).count_ones();
    }
    if union == 0 {
        0.0
    } else {
        f64::from(intersection) / f64::from(union)
    }
}

/// Tool declarations in the assistant service's wire format: the hosted
/// retrieval pipeline plus the local similarity function.
pub fn assistant_tool_specs(knowledge_base_id: &str) -> Vec<serde_json::Value> {
    vec![
        serde_json::json!({
            "type": "rag",
            "prompt_ra": {
                "pipeline_id": [knowledge_base_id],
                "multiknowledge_rerank_top_n": 10,
                "rerank_top_n": 5,
                "parameters": {
                    "type": "object",
                    "properties": {
                        "query_word": {
                            "type": "str",
                            "value": "${documents}"
                        }
                    }
                }
            }
        }),
        serde_json::json!({
            "type": "function",
            "function": {
                "name": "search_similar_materials",
                "description": "Find the best-matching known emitter material for a structure string",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "structure": {
                            "type": "string",
                            "description": "Line-notation structure string of the material"
                        },
                        "top_n": {
                            "type": "integer",
                            "description": "Candidate-set size before the quality re-sort"
                        }
                    },
                    "required": ["structure"]
                }
            }
        }),
    ]
}

/// Built-in emitter material set used when the caller supplies no records.
fn builtin_materials() -> Vec<MaterialRecord> {
    vec![
        MaterialRecord {
            structure: "CC(C)(C)c1ccc2c(c1)c1cc(C(C)(C)C)cc3c1n2-c1ccc2c4c1B3c1cc(C(C)(C)C)cc3c5cc(C(C)(C)C)cc(c5n-4c13)S2".to_string(),
            name: "tBu-DABNA-S".to_string(),
            doi: "10.1038/s41566-019-0476-5".to_string(),
            host: "mCBP".to_string(),
            emission_wavelength_nm: 465.0,
            max_eqe: "29.3".to_string(),
        },
        MaterialRecord {
            structure: "c1ccc(-n2c3ccccc3c3ccccc32)cc1".to_string(),
            name: "NPC".to_string(),
            doi: "10.1021/acs.chemmater.8b02401".to_string(),
            host: "CBP".to_string(),
            emission_wavelength_nm: 448.0,
            max_eqe: "6.1".to_string(),
        },
        MaterialRecord {
            structure: "CC1(C)c2ccccc2-c2ccc(N(c3ccccc3)c3ccc4c(c3)C(C)(C)c3ccccc3-4)cc21".to_string(),
            name: "SFA-TPA".to_string(),
            doi: "10.1002/adma.201605444".to_string(),
            host: "DPEPO".to_string(),
            emission_wavelength_nm: 472.0,
            max_eqe: "19.2".to_string(),
        },
        MaterialRecord {
            structure: "O=S(=O)(c1ccccc1)c1ccc(N2c3ccccc3Oc3ccccc32)cc1".to_string(),
            name: "PXZ-DPS".to_string(),
            doi: "10.1038/nature11687".to_string(),
            host: "DPEPO".to_string(),
            emission_wavelength_nm: 507.0,
            max_eqe: "17.5".to_string(),
        },
        MaterialRecord {
            structure: "N#Cc1cc(-n2c3ccccc3c3ccccc32)cc(N2c3ccccc3Oc3ccccc32)c1".to_string(),
            name: "CzPXZ-CN".to_string(),
            doi: "10.1002/anie.201506687".to_string(),
            host: "mCP".to_string(),
            emission_wavelength_nm: 520.0,
            max_eqe: "21.8".to_string(),
        },
        MaterialRecord {
            structure: "c1ccc2c(c1)oc1c2B2c3ccccc3N(c3ccccc3)c3ccccc32c1".to_string(),
            name: "BOBN-Ph".to_string(),
            doi: "10.1021/jacs.0c10081".to_string(),
            host: "mCBP".to_string(),
            emission_wavelength_nm: 459.0,
            max_eqe: "26.7".to_string(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(structure: &str, name: &str, max_eqe: &str) -> MaterialRecord {
        MaterialRecord {
            structure: structure.to_string(),
            name: name.to_string(),
            doi: "10.0000/test".to_string(),
            host: "host".to_string(),
            emission_wavelength_nm: 460.0,
            max_eqe: max_eqe.to_string(),
        }
    }

    #[test]
    fn identical_structure_has_similarity_one() {
        let materials = vec![record("c1ccccc1N", "aniline-like", "10.0")];
        let ranked = best_match("c1ccccc1N", &materials, 5).unwrap();
        assert!((ranked.similarity - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn quality_resort_narrows_to_single_best() {
        // Most-similar record has the lower quality; a close neighbor inside
        // the candidate set has the higher quality and must win.
        let materials = vec![
            record("CCCCCCCCCC", "exact", "8.0"),
            record("CCCCCCCCCN", "close", "24.5"),
            record("zzzzzzzzzz", "far", "99.0"),
        ];

        let ranked = best_match("CCCCCCCCCC", &materials, 2).unwrap();
        assert_eq!(ranked.record.name, "close");
        assert!((ranked.max_eqe_value - 24.5).abs() < f64::EPSILON);
    }

    #[test]
    fn top_n_one_skips_the_quality_stage_pool() {
        let materials = vec![
            record("CCCCCCCCCC", "exact", "8.0"),
            record("CCCCCCCCCN", "close", "24.5"),
        ];

        // With a candidate set of one, only the most-similar record remains
        // for the re-sort.
        let ranked = best_match("CCCCCCCCCC", &materials, 1).unwrap();
        assert_eq!(ranked.record.name, "exact");
    }

    #[test]
    fn repeated_lookups_are_deterministic() {
        let ctx = ToolContext::default();
        let query = "CC(C)(C)c1ccc2c(c1)c1cc(C(C)(C)C)cc3c1n2";

        let first = best_match(query, &ctx.materials, ctx.default_top_n).unwrap();
        let second = best_match(query, &ctx.materials, ctx.default_top_n).unwrap();

        assert_eq!(first.record.name, second.record.name);
        assert_eq!(first.similarity, second.similarity);
        assert_eq!(first.max_eqe_value, second.max_eqe_value);
    }

    #[test]
    fn empty_record_set_yields_no_match() {
        assert!(best_match("CCO", &[], 5).is_none());
    }

    #[test]
    fn percent_suffix_parses_for_ranking() {
        let materials = vec![
            record("CCCCCCCCCC", "plain", "12.0"),
            record("CCCCCCCCCN", "suffixed", "30.1 %"),
        ];
        let ranked = best_match("CCCCCCCCCC", &materials, 2).unwrap();
        assert_eq!(ranked.record.name, "suffixed");
    }

    #[test]
    fn unknown_tool_gets_placeholder_output() {
        let call = ToolCall {
            id: "call_9".to_string(),
            name: "rag".to_string(),
            arguments: serde_json::json!({}),
        };
        let output = execute_tool(&call, &ToolContext::default());
        assert_eq!(output.tool_call_id, "call_9");
        assert_eq!(output.output, "acknowledged");
    }

    #[test]
    fn lookup_dispatches_and_returns_single_result() {
        let ctx = ToolContext::default();
        let call = ToolCall {
            id: "call_1".to_string(),
            name: "search_similar_materials".to_string(),
            arguments: serde_json::json!({"structure": "c1ccc(-n2c3ccccc3c3ccccc32)cc1", "top_n": 3}),
        };

        let output = execute_tool(&call, &ctx);
        let body: serde_json::Value = serde_json::from_str(&output.output).unwrap();
        assert_eq!(body["results"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn malformed_arguments_fall_back_to_empty_object() {
        let request = ToolCallRequest {
            id: "call_3".to_string(),
            kind: "function".to_string(),
            name: Some("search_similar_materials".to_string()),
            arguments: Some("{not json".to_string()),
        };
        let call = ToolCall::from_request(&request);
        assert_eq!(call.arguments, serde_json::json!({}));
    }
}
