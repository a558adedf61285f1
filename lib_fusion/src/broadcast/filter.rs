use serde::{Deserialize, Serialize};

use crate::models::{FusionSample, Grade};

/// What a dashboard wants to see. Every present field must match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubscriptionFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_ids: Option<Vec<String>>,
    /// Lowest acceptable grade, using `A+ > A > B > C > REJECT`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_grade: Option<Grade>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grades: Option<Vec<Grade>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_score: Option<f64>,
}

impl SubscriptionFilter {
    pub fn matches(&self, sample: &FusionSample) -> bool {
        if let Some(id) = &self.device_id {
            if *id != sample.device_id {
                return false;
            }
        }
        if let Some(ids) = &self.device_ids {
            if !ids.iter().any(|id| *id == sample.device_id) {
                return false;
            }
        }
        if let Some(sites) = &self.site_ids {
            // A sample without a site can never be in a site allow-list.
            match &sample.site_id {
                Some(site) if sites.contains(site) => {}
                _ => return false,
            }
        }
        if let Some(min) = self.min_grade {
            if sample.final_grade < min {
                return false;
            }
        }
        if let Some(grades) = &self.grades {
            if !grades.contains(&sample.final_grade) {
                return false;
            }
        }
        if let Some(min) = self.min_score {
            if sample.final_score < min {
                return false;
            }
        }
        true
    }
}

/// `None` means "no filter": everything matches.
pub fn filter_matches(filter: Option<&SubscriptionFilter>, sample: &FusionSample) -> bool {
    filter.is_none_or(|f| f.matches(sample))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SensorBlock;
    use chrono::Utc;
    use serde_json::json;

    fn sample(device: &str, site: Option<&str>, score: f64, grade: Grade) -> FusionSample {
        FusionSample {
            sample_id: "s".into(),
            device_id: device.into(),
            site_id: site.map(str::to_string),
            firmware_version: None,
            timestamp: Utc::now(),
            tof_score: None,
            spectral_score: None,
            final_score: score,
            final_grade: grade,
            defects: vec![],
            compliance: true,
            geometry: SensorBlock::default(),
            spectral: SensorBlock::default(),
        }
    }

    #[test]
    fn no_filter_matches_everything() {
        let s = sample("d1", None, 0.1, Grade::Reject);
        assert!(filter_matches(None, &s));
        assert!(filter_matches(Some(&SubscriptionFilter::default()), &s));
    }

    #[test]
    fn min_grade_excludes_lower_grades() {
        let f: SubscriptionFilter = serde_json::from_value(json!({ "min_grade": "A" })).unwrap();
        assert!(f.matches(&sample("d", None, 0.99, Grade::APlus)));
        assert!(f.matches(&sample("d", None, 0.9, Grade::A)));
        for g in [Grade::B, Grade::C, Grade::Reject] {
            assert!(!f.matches(&sample("d", None, 0.9, g)), "{} slipped through", g);
        }
    }

    #[test]
    fn all_present_fields_must_match() {
        let f = SubscriptionFilter {
            device_ids: Some(vec!["d1".into(), "d2".into()]),
            min_score: Some(0.5),
            ..Default::default()
        };
        assert!(f.matches(&sample("d2", None, 0.7, Grade::B)));
        assert!(!f.matches(&sample("d3", None, 0.7, Grade::B)));
        assert!(!f.matches(&sample("d1", None, 0.4, Grade::B)));
    }

    #[test]
    fn site_filter_needs_a_site() {
        let f = SubscriptionFilter {
            site_ids: Some(vec!["plant-7".into()]),
            ..Default::default()
        };
        assert!(f.matches(&sample("d", Some("plant-7"), 0.5, Grade::C)));
        assert!(!f.matches(&sample("d", Some("plant-8"), 0.5, Grade::C)));
        assert!(!f.matches(&sample("d", None, 0.5, Grade::C)));
    }

    #[test]
    fn exact_device_and_grade_set() {
        let f: SubscriptionFilter =
            serde_json::from_value(json!({ "device_id": "d1", "grades": ["B", "REJECT"] })).unwrap();
        assert!(f.matches(&sample("d1", None, 0.2, Grade::Reject)));
        assert!(!f.matches(&sample("d1", None, 0.9, Grade::A)));
        assert!(!f.matches(&sample("d2", None, 0.5, Grade::B)));
    }

    #[test]
    fn unknown_filter_fields_are_rejected() {
        assert!(serde_json::from_value::<SubscriptionFilter>(json!({ "colour": "red" })).is_err());
    }
}
