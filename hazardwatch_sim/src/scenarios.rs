//! Stress scenarios for the corroboration engine.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// DST-001: Many people photograph one pothole at once
    FlashMob,

    /// DST-002: One session spams the same spot
    SelfVerify,

    /// DST-003: Concurrent reports straddling an H3 cell edge
    BoundaryRace,

    /// DST-004: A spot goes quiet past the window, then is reported again
    StaleSpot,

    /// DST-005: Reports scattered across a city, many in parallel
    CitySpread,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::FlashMob,
            ScenarioId::SelfVerify,
            ScenarioId::BoundaryRace,
            ScenarioId::StaleSpot,
            ScenarioId::CitySpread,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::FlashMob => "flash_mob",
            ScenarioId::SelfVerify => "self_verify",
            ScenarioId::BoundaryRace => "boundary_race",
            ScenarioId::StaleSpot => "stale_spot",
            ScenarioId::CitySpread => "city_spread",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::FlashMob => "K concurrent reports of one spot, expect one VERIFIED cluster of K",
            ScenarioId::SelfVerify => "One session reporting repeatedly, expect the cluster to stay PENDING",
            ScenarioId::BoundaryRace => "Reports on both sides of a cell edge, expect a single cluster",
            ScenarioId::StaleSpot => "Idle past the window, expect EXPIRED and a fresh cluster",
            ScenarioId::CitySpread => "City-wide parallel load, expect no PENDING pair within radius",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "flash_mob" | "flashmob" | "dst-001" => Ok(ScenarioId::FlashMob),
            "self_verify" | "selfverify" | "dst-002" => Ok(ScenarioId::SelfVerify),
            "boundary_race" | "boundaryrace" | "dst-003" => Ok(ScenarioId::BoundaryRace),
            "stale_spot" | "stalespot" | "dst-004" => Ok(ScenarioId::StaleSpot),
            "city_spread" | "cityspread" | "dst-005" => Ok(ScenarioId::CitySpread),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_names_parse_back() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>(), Ok(scenario));
            assert_eq!(scenario.to_string(), scenario.name());
        }
        assert_eq!("DST-003".parse::<ScenarioId>(), Ok(ScenarioId::BoundaryRace));
        assert!("time_warp".parse::<ScenarioId>().is_err());
    }
}
