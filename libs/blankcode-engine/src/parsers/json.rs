// Locate a JSON object embedded in mixed runner output.
//
// Runners that print a JSON report usually interleave it with other text
// (console output, a second reporter). The object is found by walking back
// from the last occurrence of a marker key to each preceding '{' and
// brace-matching forward, string- and escape-aware, until the match spans
// the marker. Candidates come back innermost first.

const MAX_CANDIDATE_STARTS: usize = 64;

/// Index one past the '}' closing the object that opens at `start`.
fn matching_close(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(start + offset + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Every balanced `{...}` slice that encloses the last occurrence of `marker`.
pub fn enclosing_objects<'a>(output: &'a str, marker: &str) -> Vec<&'a str> {
    let Some(marker_at) = output.rfind(marker) else {
        return Vec::new();
    };
    let bytes = output.as_bytes();
    let marker_end = marker_at + marker.len();

    let mut candidates = Vec::new();
    let starts = bytes[..marker_at]
        .iter()
        .enumerate()
        .rev()
        .filter(|(_, &b)| b == b'{')
        .map(|(i, _)| i)
        .take(MAX_CANDIDATE_STARTS);

    for start in starts {
        if let Some(end) = matching_close(bytes, start) {
            if end >= marker_end {
                // '{' and '}' are ASCII, so these are char boundaries.
                candidates.push(&output[start..end]);
            }
        }
    }
    candidates
}

/// First candidate that decodes as `T`.
pub fn decode_embedded<T: serde::de::DeserializeOwned>(output: &str, marker: &str) -> Option<T> {
    enclosing_objects(output, marker)
        .into_iter()
        .find_map(|candidate| serde_json::from_str::<T>(candidate).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Report {
        #[serde(rename = "testResults")]
        test_results: Vec<serde_json::Value>,
    }

    #[test]
    fn test_nested_braces_and_trailing_text() {
        let output = r#"console noise {not json}
{"numTotalTests":1,"testResults":[{"name":"a","assertionResults":[{"title":"x {y}","status":"passed"}]}]}
 ✓ solution.test.ts > x {y} 2ms
 Test Files  1 passed (1)"#;
        let report: Report = decode_embedded(output, "\"testResults\"").unwrap();
        assert_eq!(report.test_results.len(), 1);
    }

    #[test]
    fn test_braces_inside_strings() {
        let output = r#"{"testResults":[{"msg":"unbalanced } and \" quote {"}]}"#;
        let candidates = enclosing_objects(output, "\"testResults\"");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0], output);
    }

    #[test]
    fn test_missing_marker_or_truncated() {
        assert!(enclosing_objects("no json here", "\"testResults\"").is_empty());
        let truncated = r#"{"testResults":[{"name":"a""#;
        assert!(decode_embedded::<Report>(truncated, "\"testResults\"").is_none());
    }

    #[test]
    fn test_uses_last_marker() {
        let output = r#"{"testResults":[]} then {"testResults":[1,2]}"#;
        let report: Report = decode_embedded(output, "\"testResults\"").unwrap();
        assert_eq!(report.test_results.len(), 2);
    }
}
