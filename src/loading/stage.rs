use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One ordered phase of a load sequence.
///
/// `Critical` establishes whether the resource exists at all; `Full` and
/// `Enhancement` are additive and may fail without failing the sequence.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
  Critical,
  Full,
  Enhancement,
}

impl Stage {
  /// All stages in execution order.
  pub const ALL: [Stage; 3] = [Stage::Critical, Stage::Full, Stage::Enhancement];

  pub fn as_str(&self) -> &'static str {
    match self {
      Stage::Critical => "critical",
      Stage::Full => "full",
      Stage::Enhancement => "enhancement",
    }
  }

  /// The stage that runs after this one, if any.
  pub fn next(&self) -> Option<Stage> {
    match self {
      Stage::Critical => Some(Stage::Full),
      Stage::Full => Some(Stage::Enhancement),
      Stage::Enhancement => None,
    }
  }

  pub fn is_mandatory(&self) -> bool {
    matches!(self, Stage::Critical)
  }
}

impl fmt::Display for Stage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Stage {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "critical" => Ok(Stage::Critical),
      "full" => Ok(Stage::Full),
      "enhancement" => Ok(Stage::Enhancement),
      other => Err(format!("unknown stage: {}", other)),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_stages_are_totally_ordered() {
    assert!(Stage::Critical < Stage::Full);
    assert!(Stage::Full < Stage::Enhancement);
    assert_eq!(Stage::Critical.next(), Some(Stage::Full));
    assert_eq!(Stage::Enhancement.next(), None);
  }

  #[test]
  fn test_parse_stage() {
    assert_eq!("Full".parse::<Stage>(), Ok(Stage::Full));
    assert!("bogus".parse::<Stage>().is_err());
  }
}
