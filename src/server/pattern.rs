//! Operator URL template translation.
//!
//! Route patterns come from configuration as templates like
//! `/osm/all/{z}/{x}/{y}.{fmt}`. The router only supports one capture per
//! path segment, so segments packing several variables are rewritten to a
//! single synthetic capture and re-split per request, greedily from the
//! right (the same variables `10.0.json` resolves to `y=10.0`, `fmt=json`).

use thiserror::Error;

use crate::state::PathVars;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PatternError {
    #[error("unbalanced braces in segment {0:?}")]
    UnbalancedBraces(String),

    #[error("adjacent variables without a separator in segment {0:?}")]
    AdjacentVariables(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Lit(String),
    Var(String),
}

/// A path segment that packs several variables into one capture.
#[derive(Debug, Clone)]
struct CompoundSegment {
    /// Synthetic capture name used in the rewritten route
    param: String,
    parts: Vec<Part>,
}

/// A parsed route template: the rewritten router path plus instructions for
/// re-splitting compound captures.
#[derive(Debug, Clone)]
pub struct RoutePattern {
    template: String,
    route_path: String,
    compound: Vec<CompoundSegment>,
}

impl RoutePattern {
    pub fn parse(template: &str) -> Result<Self, PatternError> {
        let mut route_segments = Vec::new();
        let mut compound = Vec::new();

        for segment in template.split('/') {
            if !segment.contains('{') && !segment.contains('}') {
                route_segments.push(segment.to_string());
                continue;
            }

            let parts = split_segment(segment)?;
            // a segment that is exactly one variable maps straight through
            if let [Part::Var(name)] = parts.as_slice() {
                route_segments.push(format!("{{{}}}", name));
                continue;
            }

            let param = format!("seg{}", compound.len());
            route_segments.push(format!("{{{}}}", param));
            compound.push(CompoundSegment { param, parts });
        }

        Ok(Self {
            template: template.to_string(),
            route_path: route_segments.join("/"),
            compound,
        })
    }

    /// The original configured template.
    pub fn template(&self) -> &str {
        &self.template
    }

    /// The path to register with the router.
    pub fn route_path(&self) -> &str {
        &self.route_path
    }

    /// Resolve the raw router captures into template variables.
    ///
    /// Synthetic captures are re-split; a capture that does not match its
    /// segment's literals simply contributes no variables, which the parsers
    /// then report as a bad format or coordinate.
    pub fn extract(&self, raw: &PathVars) -> PathVars {
        let mut vars: PathVars = raw
            .iter()
            .filter(|(name, _)| !self.compound.iter().any(|c| &c.param == *name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        for segment in &self.compound {
            let Some(value) = raw.get(&segment.param) else {
                continue;
            };
            if let Some(matched) = match_parts(&segment.parts, value) {
                vars.extend(matched);
            }
        }

        vars
    }
}

/// Split a segment template into literal and variable parts.
fn split_segment(segment: &str) -> Result<Vec<Part>, PatternError> {
    let mut parts = Vec::new();
    let mut rest = segment;

    while let Some(open) = rest.find('{') {
        if open > 0 {
            parts.push(Part::Lit(rest[..open].to_string()));
        }
        let after = &rest[open + 1..];
        let close = after
            .find('}')
            .ok_or_else(|| PatternError::UnbalancedBraces(segment.to_string()))?;
        let name = &after[..close];
        if name.contains('{') {
            return Err(PatternError::UnbalancedBraces(segment.to_string()));
        }
        if let Some(Part::Var(_)) = parts.last() {
            return Err(PatternError::AdjacentVariables(segment.to_string()));
        }
        parts.push(Part::Var(name.to_string()));
        rest = &after[close + 1..];
    }
    if rest.contains('}') {
        return Err(PatternError::UnbalancedBraces(segment.to_string()));
    }
    if !rest.is_empty() {
        parts.push(Part::Lit(rest.to_string()));
    }

    Ok(parts)
}

/// Match a captured value against the segment parts, binding variables
/// greedily from the right.
fn match_parts(parts: &[Part], value: &str) -> Option<Vec<(String, String)>> {
    let mut out = Vec::new();
    let mut rest = value;
    let mut i = 0;

    while i < parts.len() {
        match &parts[i] {
            Part::Lit(lit) => {
                rest = rest.strip_prefix(lit.as_str())?;
                i += 1;
            }
            Part::Var(name) => {
                if i + 1 == parts.len() {
                    if rest.is_empty() {
                        return None;
                    }
                    out.push((name.clone(), rest.to_string()));
                    rest = "";
                    i += 1;
                } else {
                    // construction guarantees a literal follows a variable
                    let Part::Lit(lit) = &parts[i + 1] else {
                        return None;
                    };
                    let pos = rest.rfind(lit.as_str())?;
                    if pos == 0 {
                        return None;
                    }
                    out.push((name.clone(), rest[..pos].to_string()));
                    rest = &rest[pos + lit.len()..];
                    i += 2;
                }
            }
        }
    }

    if rest.is_empty() {
        Some(out)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn raw(pairs: &[(&str, &str)]) -> PathVars {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_simple_variables_pass_through() {
        let pattern = RoutePattern::parse("/osm/all/{z}/{x}/{y}").unwrap();
        assert_eq!(pattern.route_path(), "/osm/all/{z}/{x}/{y}");

        let vars = pattern.extract(&raw(&[("z", "1"), ("x", "2"), ("y", "3")]));
        assert_eq!(vars.get("z").map(String::as_str), Some("1"));
        assert_eq!(vars.get("y").map(String::as_str), Some("3"));
    }

    #[test]
    fn test_compound_tail_segment() {
        let pattern = RoutePattern::parse("/osm/all/{z}/{x}/{y}.{fmt}").unwrap();
        assert_eq!(pattern.route_path(), "/osm/all/{z}/{x}/{seg0}");

        let vars = pattern.extract(&raw(&[("z", "12"), ("x", "637"), ("seg0", "936.json")]));
        assert_eq!(vars.get("z").map(String::as_str), Some("12"));
        assert_eq!(vars.get("y").map(String::as_str), Some("936"));
        assert_eq!(vars.get("fmt").map(String::as_str), Some("json"));
        assert!(!vars.contains_key("seg0"));
    }

    #[test]
    fn test_compound_split_is_greedy() {
        let pattern = RoutePattern::parse("/{y}.{fmt}").unwrap();
        let vars = pattern.extract(&raw(&[("seg0", "10.0.json")]));
        assert_eq!(vars.get("y").map(String::as_str), Some("10.0"));
        assert_eq!(vars.get("fmt").map(String::as_str), Some("json"));
    }

    #[test]
    fn test_compound_with_literal_suffix() {
        let pattern = RoutePattern::parse("/tilejson/{fmt}.json").unwrap();
        assert_eq!(pattern.route_path(), "/tilejson/{seg0}");

        let vars = pattern.extract(&raw(&[("seg0", "mapbox.json")]));
        assert_eq!(vars.get("fmt").map(String::as_str), Some("mapbox"));
    }

    #[test]
    fn test_unmatched_compound_yields_no_vars() {
        let pattern = RoutePattern::parse("/{y}.{fmt}").unwrap();
        let vars = pattern.extract(&raw(&[("seg0", "nodot")]));
        assert!(vars.get("y").is_none());
        assert!(vars.get("fmt").is_none());
    }

    #[test]
    fn test_bad_templates() {
        assert_eq!(
            RoutePattern::parse("/{y.{fmt}").unwrap_err(),
            PatternError::UnbalancedBraces("{y.{fmt}".to_string())
        );
        assert!(matches!(
            RoutePattern::parse("/{y}.{fmt"),
            Err(PatternError::UnbalancedBraces(_))
        ));
        assert!(matches!(
            RoutePattern::parse("/{y}{fmt}"),
            Err(PatternError::AdjacentVariables(_))
        ));
    }
}
