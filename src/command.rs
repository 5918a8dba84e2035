//! Clip command composition and parsing.
//!
//! The applier submits one complete string; sending it token by token lets
//! the host read a partial token as a different command. [`parse`] reads the
//! string back with the pest grammar in `command.pest`; the simulated host
//! uses it to realize submissions.

use glam::{DVec2, dvec2};
use pest::Parser;
use pest::iterators::Pair;
use pest_derive::Parser;

use crate::defaults;
use crate::types::ClipBoundary;

#[derive(Parser)]
#[grammar = "command.pest"]
pub struct CommandParser;

/// Ends the command (the host's Enter).
pub const TERMINATOR: &str = "\n";

/// Double escape: aborts whatever command is active, including a half-typed one.
pub const CANCEL_SEQUENCE: &str = "\x03\x03";

/// Host-specific keyword tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTokens {
    pub clip: String,
    pub select: String,
    pub new: String,
    pub rectangle: String,
    pub precision: usize,
}

impl Default for CommandTokens {
    fn default() -> Self {
        Self {
            clip: "_.XCLIP".to_string(),
            select: "_P".to_string(),
            new: "_N".to_string(),
            rectangle: "_R".to_string(),
            precision: defaults::COORD_PRECISION,
        }
    }
}

impl CommandTokens {
    /// Global command name the host reports in lifecycle events
    /// (`_.XCLIP` -> `XCLIP`).
    pub fn command_name(&self) -> String {
        self.clip
            .trim_start_matches(['_', '.', '\''])
            .to_ascii_uppercase()
    }

    pub fn matches_command(&self, name: &str) -> bool {
        name.eq_ignore_ascii_case(&self.command_name())
    }

    fn coord(&self, v: f64) -> String {
        // -0.0 would print as "-0.000000"
        let v = if v == 0.0 { 0.0 } else { v };
        format!("{:.*}", self.precision, v)
    }

    fn point(&self, p: DVec2) -> String {
        format!("{},{}", self.coord(p.x), self.coord(p.y))
    }

    /// Compose the full submission for a rectangular clip.
    pub fn compose(&self, boundary: &ClipBoundary) -> String {
        format!(
            "{} {} {} {} {} {} {}",
            self.clip,
            self.select,
            self.new,
            self.rectangle,
            self.point(boundary.min),
            self.point(boundary.max),
            TERMINATOR
        )
    }
}

/// A parsed clip command.
#[derive(Debug, Clone, PartialEq)]
pub struct ClipCommand {
    pub clip: String,
    pub select: String,
    pub new: String,
    pub rectangle: String,
    pub corner1: DVec2,
    pub corner2: DVec2,
}

impl ClipCommand {
    /// Whether the keyword tokens are exactly `tokens`.
    pub fn uses(&self, tokens: &CommandTokens) -> bool {
        self.clip == tokens.clip
            && self.select == tokens.select
            && self.new == tokens.new
            && self.rectangle == tokens.rectangle
    }
}

pub fn parse(source: &str) -> Result<ClipCommand, miette::Report> {
    let command = CommandParser::parse(Rule::command, source)
        .map_err(|e| miette::miette!("Parse error: {}", e))?
        .next()
        .ok_or_else(|| miette::miette!("empty command"))?;

    let mut ops = Vec::with_capacity(4);
    let mut points = Vec::with_capacity(2);
    for pair in command.into_inner() {
        match pair.as_rule() {
            Rule::op => ops.push(pair.as_str().to_string()),
            Rule::point => points.push(parse_point(pair)?),
            Rule::terminator | Rule::EOI => {}
            other => return Err(miette::miette!("Unexpected rule in command: {:?}", other)),
        }
    }

    let [clip, select, new, rectangle]: [String; 4] = ops
        .try_into()
        .map_err(|ops: Vec<String>| miette::miette!("expected 4 keywords, got {}", ops.len()))?;
    let [corner1, corner2]: [DVec2; 2] = points
        .try_into()
        .map_err(|pts: Vec<DVec2>| miette::miette!("expected 2 corners, got {}", pts.len()))?;

    Ok(ClipCommand {
        clip,
        select,
        new,
        rectangle,
        corner1,
        corner2,
    })
}

fn parse_point(pair: Pair<Rule>) -> Result<DVec2, miette::Report> {
    let mut coords = pair.into_inner().map(|n| {
        n.as_str()
            .parse::<f64>()
            .map_err(|e| miette::miette!("Invalid number {:?}: {}", n.as_str(), e))
    });
    let x = coords
        .next()
        .ok_or_else(|| miette::miette!("point without x"))??;
    let y = coords
        .next()
        .ok_or_else(|| miette::miette!("point without y"))??;
    Ok(dvec2(x, y))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boundary(x1: f64, y1: f64, x2: f64, y2: f64) -> ClipBoundary {
        ClipBoundary {
            min: dvec2(x1, y1),
            max: dvec2(x2, y2),
            fallback: false,
        }
    }

    #[test]
    fn compose_fixed_precision() {
        let cmd = CommandTokens::default().compose(&boundary(0.5, 0.5, 9.5, 9.5));
        insta::assert_snapshot!(
            cmd.trim_end(),
            @"_.XCLIP _P _N _R 0.500000,0.500000 9.500000,9.500000"
        );
        assert!(cmd.ends_with(" \n"));
    }

    #[test]
    fn compose_normalizes_negative_zero() {
        let cmd = CommandTokens::default().compose(&boundary(-0.0, -1.25, 3.0, 0.0));
        assert!(cmd.contains(" 0.000000,-1.250000 "), "{cmd}");
    }

    #[test]
    fn compose_custom_precision() {
        let tokens = CommandTokens {
            precision: 2,
            ..CommandTokens::default()
        };
        let cmd = tokens.compose(&boundary(1.0 / 3.0, 2.0, 4.0, 5.0));
        assert!(cmd.contains(" 0.33,2.00 4.00,5.00 "), "{cmd}");
    }

    #[test]
    fn parse_composed_command() {
        let tokens = CommandTokens::default();
        let cmd = tokens.compose(&boundary(-2.5, 1.0, 7.125, 8.0));
        let parsed = parse(&cmd).unwrap();
        assert!(parsed.uses(&tokens));
        assert_eq!(parsed.corner1, dvec2(-2.5, 1.0));
        assert_eq!(parsed.corner2, dvec2(7.125, 8.0));
    }

    #[test]
    fn parse_rejects_missing_terminator() {
        assert!(parse("_.XCLIP _P _N _R 0,0 1,1").is_err());
    }

    #[test]
    fn parse_rejects_locale_comma_decimals() {
        // "0,5,0,5" is what a comma-decimal locale would have produced
        assert!(parse("_.XCLIP _P _N _R 0,5,0,5 9,5,9,5 \n").is_err());
    }

    #[test]
    fn parse_rejects_split_submission() {
        assert!(parse("_.XCLIP \n").is_err());
    }

    #[test]
    fn command_name_strips_prefixes() {
        let tokens = CommandTokens::default();
        assert_eq!(tokens.command_name(), "XCLIP");
        assert!(tokens.matches_command("xclip"));
        assert!(!tokens.matches_command("LINE"));
    }
}
