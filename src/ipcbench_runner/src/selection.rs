//! Scenario selection
use ipcbench::ScenarioDescriptor;
use thiserror::Error;

/// A property of a scenario that can be required or excluded by a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    /// The server runs on the client's scheduling budget.
    Donation,
    /// The client and the server share an address space.
    SameVspace,
    /// An idle dummy context is present.
    Dummy,
    /// The scenario exchanges long messages.
    Long,
}

impl Feature {
    pub const ALL: [Self; 4] = [Self::Donation, Self::SameVspace, Self::Dummy, Self::Long];

    /// The CLI name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Donation => "donation",
            Self::SameVspace => "samevspace",
            Self::Dummy => "dummy",
            Self::Long => "long",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.as_str() == name)
    }

    fn is_present_in(self, scenario: &ScenarioDescriptor) -> bool {
        match self {
            Self::Donation => scenario.same_sc,
            Self::SameVspace => scenario.same_vspace,
            Self::Dummy => scenario.dummy_prio.is_some(),
            Self::Long => scenario.is_long(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScenarioFilter {
    Pass,
    NameContains(String),
    HasFeature(Feature, bool),
    Conjunction(Vec<ScenarioFilter>),
    Disjunction(Vec<ScenarioFilter>),
}

impl ScenarioFilter {
    pub fn matches(&self, scenario: &ScenarioDescriptor) -> bool {
        match self {
            Self::Pass => true,
            Self::NameContains(needle) => scenario.name.contains(needle.as_str()),
            Self::HasFeature(feature, value) => feature.is_present_in(scenario) == *value,
            Self::Conjunction(subfilters) => {
                subfilters.iter().all(|subfilter| subfilter.matches(scenario))
            }
            Self::Disjunction(subfilters) => {
                subfilters.iter().any(|subfilter| subfilter.matches(scenario))
            }
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScenarioFilterParseError {
    #[error("Unknown feature: '{0}'")]
    UnknownFeature(String),
}

impl std::str::FromStr for ScenarioFilter {
    type Err = ScenarioFilterParseError;

    /// Parse a filter string.
    ///
    /// A filter string should be specified in the following form:
    /// `needle+feat1-feat2`
    ///
    ///  - `needle` chooses the scenarios whose names contain `needle`.
    ///  - `+feat1` requires the feature `feat1`.
    ///  - `-feat2` excludes the feature `feat2`.
    ///
    /// Scenario names contain `-` themselves (`Inter-AS Call`), so features
    /// are peeled off from the end, and a `-` not followed by a feature name
    /// is part of the needle. `+` is always followed by a feature name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut needle = s;
        let mut features = Vec::new();

        while let Some(i) = needle.rfind(&['-', '+'][..]) {
            let incl = needle.as_bytes()[i] == b'+';
            let name = &needle[i + 1..];
            match Feature::from_name(name) {
                Some(feature) => features.push(ScenarioFilter::HasFeature(feature, incl)),
                None if incl => {
                    return Err(ScenarioFilterParseError::UnknownFeature(name.to_owned()))
                }
                None => break,
            }
            needle = &needle[..i];
        }

        let flt = if needle.is_empty() {
            ScenarioFilter::Pass
        } else {
            ScenarioFilter::NameContains(needle.to_owned())
        };

        Ok(if features.is_empty() {
            flt
        } else {
            features.reverse();
            features.push(flt);
            ScenarioFilter::Conjunction(features)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipcbench::Matrix;

    fn select(filter: &str) -> Vec<String> {
        let filter: ScenarioFilter = filter.parse().unwrap();
        Matrix::standard(10)
            .iter()
            .filter(|s| filter.matches(s))
            .map(|s| s.name.clone())
            .collect()
    }

    #[test]
    fn parse() {
        use self::{Feature::*, ScenarioFilter::*};
        assert_eq!(
            "Call".parse::<ScenarioFilter>(),
            Ok(NameContains("Call".to_owned()))
        );
        assert_eq!(
            "Inter-AS Call".parse::<ScenarioFilter>(),
            Ok(NameContains("Inter-AS Call".to_owned()))
        );
        assert_eq!(
            "Inter-AS+donation-dummy".parse::<ScenarioFilter>(),
            Ok(Conjunction(vec![
                HasFeature(Donation, true),
                HasFeature(Dummy, false),
                NameContains("Inter-AS".to_owned()),
            ]))
        );
        assert_eq!(
            "+long".parse::<ScenarioFilter>(),
            Ok(Conjunction(vec![HasFeature(Long, true), Pass]))
        );
        assert_eq!(
            "Call+fast".parse::<ScenarioFilter>(),
            Err(ScenarioFilterParseError::UnknownFeature("fast".to_owned()))
        );
    }

    #[test]
    fn by_name() {
        assert_eq!(
            select("Intra-AS Call"),
            ["Intra-AS Call", "Intra-AS Call (same SC)"]
        );
        assert_eq!(
            select("Signal"),
            ["Signal to high prio thread", "Signal to low prio thread"]
        );
        assert!(select("Nonexistent").is_empty());
    }

    #[test]
    fn by_feature() {
        assert_eq!(
            select("+donation+dummy"),
            [
                "Inter-AS Call (same SC, dummy)",
                "Inter-AS ReplyRecv (same SC, dummy)"
            ]
        );
        assert_eq!(
            select("+samevspace-donation"),
            ["Intra-AS Call", "Intra-AS ReplyRecv"]
        );
        assert_eq!(select("+long"), ["Inter-AS Call(10)", "Inter-AS ReplyRecv(10)"]);
        assert_eq!(select("-donation").len(), 13);
    }
}
