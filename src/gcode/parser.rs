//! A small line parser for the two command shapes the frontend accepts:
//! traditional codes with letter-prefixed parameters (`G1 X10 F600`) and
//! extended commands with `KEY=VALUE` parameters
//! (`SET_GCODE_OFFSET X_ADJUST=-0.1 MOVE=1`).

use super::error::GCodeError;
use indexmap::IndexMap;

#[derive(Debug, Clone)]
pub struct GCodeCommand {
    name: String,
    params: IndexMap<String, String>,
    raw: String,
}

// G1, M220, T0, ... as opposed to extended commands
fn is_traditional(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some('G') | Some('M') | Some('T') => chars.all(|c| c.is_ascii_digit() || c == '.'),
        _ => false,
    }
}

impl GCodeCommand {
    /// Parses one line. Returns `None` for empty lines and comments.
    pub fn parse(line: &str) -> Result<Option<Self>, GCodeError> {
        let clean = line.split(';').next().unwrap_or("").trim();
        if clean.is_empty() {
            return Ok(None);
        }
        let mut parts = clean.split_whitespace();
        // the unwrap can't fail, clean isn't empty
        let name = parts.next().unwrap().to_ascii_uppercase();
        let traditional = is_traditional(&name);
        let mut params = IndexMap::new();
        for part in parts {
            if let Some(eq) = part.find('=') {
                params.insert(
                    part[..eq].to_ascii_uppercase(),
                    String::from(&part[eq + 1..]),
                );
            } else if traditional {
                let mut chars = part.chars();
                // the unwrap can't fail, split_whitespace never yields ""
                let key = chars.next().unwrap().to_ascii_uppercase();
                params.insert(key.to_string(), String::from(chars.as_str()));
            } else {
                return Err(GCodeError::Malformed(String::from(clean)));
            }
        }
        Ok(Some(Self {
            name,
            params,
            raw: String::from(clean),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn commandline(&self) -> &str {
        &self.raw
    }

    pub fn has(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(|v| v.as_str())
    }

    pub fn get_float(&self, key: &str) -> Result<Option<f64>, GCodeError> {
        match self.params.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<f64>()
                .map(Some)
                .map_err(|_| GCodeError::ParseError(self.raw.clone())),
        }
    }

    pub fn get_float_or(&self, key: &str, default: f64) -> Result<f64, GCodeError> {
        Ok(self.get_float(key)?.unwrap_or(default))
    }

    pub fn get_float_above(
        &self,
        key: &str,
        default: f64,
        above: f64,
    ) -> Result<f64, GCodeError> {
        let value = self.get_float_or(key, default)?;
        if value <= above {
            return Err(GCodeError::MustBeAbove(
                self.raw.clone(),
                String::from(key),
                above,
            ));
        }
        Ok(value)
    }

    pub fn get_int_or(&self, key: &str, default: i64) -> Result<i64, GCodeError> {
        match self.params.get(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|_| GCodeError::ParseError(self.raw.clone())),
        }
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_traditional_params() {
        let cmd = GCodeCommand::parse("G1 X10 Y-5.5 F600").unwrap().unwrap();
        assert_eq!(cmd.name(), "G1");
        assert_eq!(cmd.get_float("X").unwrap(), Some(10.));
        assert_eq!(cmd.get_float("Y").unwrap(), Some(-5.5));
        assert_eq!(cmd.get_float("F").unwrap(), Some(600.));
        assert_eq!(cmd.get_float("Z").unwrap(), None);
    }

    #[test]
    fn parses_bare_axis_flags() {
        let cmd = GCodeCommand::parse("g28 x Y").unwrap().unwrap();
        assert_eq!(cmd.name(), "G28");
        assert!(cmd.has("X"));
        assert!(cmd.has("Y"));
        assert!(!cmd.has("Z"));
    }

    #[test]
    fn parses_extended_commands() {
        let cmd = GCodeCommand::parse("SET_GCODE_OFFSET Z_ADJUST=-0.1 MOVE=1")
            .unwrap()
            .unwrap();
        assert_eq!(cmd.get_float("Z_ADJUST").unwrap(), Some(-0.1));
        assert_eq!(cmd.get_int_or("MOVE", 0).unwrap(), 1);
    }

    #[test]
    fn rejects_bare_words_in_extended_commands() {
        assert!(matches!(
            GCodeCommand::parse("RESTORE_GCODE_STATE default"),
            Err(GCodeError::Malformed(_))
        ));
    }

    #[test]
    fn skips_comments_and_blanks() {
        assert!(GCodeCommand::parse("; a comment").unwrap().is_none());
        assert!(GCodeCommand::parse("   ").unwrap().is_none());
        let cmd = GCodeCommand::parse("G1 X1 ; inline").unwrap().unwrap();
        assert_eq!(cmd.get_float("X").unwrap(), Some(1.));
    }

    #[test]
    fn bad_float_reports_whole_line() {
        let cmd = GCodeCommand::parse("G1 Xbad").unwrap().unwrap();
        assert!(matches!(
            cmd.get_float("X"),
            Err(GCodeError::ParseError(line)) if line == "G1 Xbad"
        ));
    }
}
