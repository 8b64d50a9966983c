//! Correlates execution units with the resource, stage and generation they
//! were created for

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;

use crate::unit::{self, Stage};

/// Filtered view over a list of units
///
/// Every predicate is optional and predicates combine with AND. Units whose
/// labels are missing or malformed never match a stage or generation
/// predicate.
#[derive(Clone, Debug)]
pub struct UnitFilter<'a> {
    units: &'a [Job],
    stage: Option<Stage>,
    generation: Option<i64>,
    owner_uid: Option<&'a str>,
    namespace: Option<&'a str>,
    name: Option<&'a str>,
    retry: Option<i64>,
}

impl<'a> UnitFilter<'a> {
    /// Start a filter over `units` with no predicates
    pub fn new(units: &'a [Job]) -> Self {
        Self {
            units,
            stage: None,
            generation: None,
            owner_uid: None,
            namespace: None,
            name: None,
            retry: None,
        }
    }

    /// Match units for this stage
    pub fn stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Match units created for this generation
    pub fn generation(mut self, generation: i64) -> Self {
        self.generation = Some(generation);
        self
    }

    /// Match units owned by this resource UID
    pub fn owner_uid(mut self, uid: &'a str) -> Self {
        self.owner_uid = Some(uid);
        self
    }

    /// Match units in this namespace
    pub fn namespace(mut self, namespace: &'a str) -> Self {
        self.namespace = Some(namespace);
        self
    }

    /// Match the unit with this name
    pub fn name(mut self, name: &'a str) -> Self {
        self.name = Some(name);
        self
    }

    /// Match only units created for this retry marker
    ///
    /// Markers compare at whole-second precision. Without a marker units match
    /// whatever marker they were created for.
    pub fn retry(mut self, marker: Option<DateTime<Utc>>) -> Self {
        self.retry = marker.map(|ts| ts.timestamp());
        self
    }

    fn matches(&self, job: &Job) -> bool {
        if let Some(stage) = self.stage {
            if unit::stage_of(job) != Some(stage) {
                return false;
            }
        }
        if let Some(generation) = self.generation {
            if unit::generation_of(job) != Some(generation) {
                return false;
            }
        }
        if let Some(uid) = self.owner_uid {
            if unit::owner_uid_of(job) != Some(uid) {
                return false;
            }
        }
        if let Some(namespace) = self.namespace {
            if job.metadata.namespace.as_deref() != Some(namespace) {
                return false;
            }
        }
        if let Some(name) = self.name {
            if job.metadata.name.as_deref() != Some(name) {
                return false;
            }
        }
        if let Some(marker) = self.retry {
            if unit::retry_of(job) != Some(marker) {
                return false;
            }
        }
        true
    }

    /// Matching units, or None when nothing matched
    pub fn list(&self) -> Option<Vec<&'a Job>> {
        let matched: Vec<&'a Job> = self.units.iter().filter(|j| self.matches(j)).collect();
        (!matched.is_empty()).then_some(matched)
    }

    /// Matching unit with the newest creation timestamp
    ///
    /// Ties keep the first unit encountered.
    pub fn latest(&self) -> Option<&'a Job> {
        self.units
            .iter()
            .filter(|j| self.matches(j))
            .fold(None, |best: Option<&'a Job>, job| match best {
                Some(current) if unit::created_at(job) <= unit::created_at(current) => {
                    Some(current)
                }
                _ => Some(job),
            })
    }
}
