/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Declarative sweeps.
//!
//! A sweep is a set of named axes. Independent axes carry a fixed list of values; derived axes
//! compute their values from axes they depend on. Filters drop combinations. Expansion is the
//! Cartesian product of all axes in declaration order, repeated once per replica:
//!
//! ```text
//!  axes:   f = [1, 2]      keys = [1, 10]
//!  pass 1: (1, 1) (1, 10) (2, 1) (2, 10)
//!  pass 2: (1, 1) (1, 10) (2, 1) (2, 10)
//! ```

use crate::{errors::ConfigError, summary::Projection, trial_input::TrialInput};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<Value>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Tuple(_) => "tuple",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Ints widen to floats, nothing else converts.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Value]> {
        match self {
            Value::Tuple(values) => Some(values),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Tuple(values) => write!(f, "({})", values.iter().join(", ")),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value as i64)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Int(value as i64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl<A: Into<Value>, B: Into<Value>> From<(A, B)> for Value {
    fn from((a, b): (A, B)) -> Self {
        Value::Tuple(vec![a.into(), b.into()])
    }
}

/// One point in the sweep: a value for every axis, kept in axis-declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment(Vec<(String, Value)>);

impl Assignment {
    pub fn get(&self, axis: &str) -> Option<&Value> {
        self.0.iter().find(|(name, _)| name == axis).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value))
    }

    fn require(&self, axis: &str) -> Result<&Value, ConfigError> {
        self.get(axis).ok_or_else(|| ConfigError::UnknownAxis {
            axis: axis.to_string(),
            referenced_by: "trial builder".to_string(),
        })
    }

    fn mismatch(axis: &str, expected: &'static str, found: &Value) -> ConfigError {
        ConfigError::AxisType {
            axis: axis.to_string(),
            expected,
            found: found.type_name().to_string(),
        }
    }

    pub fn int(&self, axis: &str) -> Result<i64, ConfigError> {
        let value = self.require(axis)?;
        value
            .as_i64()
            .ok_or_else(|| Self::mismatch(axis, "int", value))
    }

    pub fn uint(&self, axis: &str) -> Result<u32, ConfigError> {
        let value = self.require(axis)?;
        value
            .as_i64()
            .and_then(|i| u32::try_from(i).ok())
            .ok_or_else(|| Self::mismatch(axis, "non-negative int", value))
    }

    pub fn float(&self, axis: &str) -> Result<f64, ConfigError> {
        let value = self.require(axis)?;
        value
            .as_f64()
            .ok_or_else(|| Self::mismatch(axis, "number", value))
    }

    pub fn str(&self, axis: &str) -> Result<&str, ConfigError> {
        let value = self.require(axis)?;
        value
            .as_str()
            .ok_or_else(|| Self::mismatch(axis, "string", value))
    }

    pub fn tuple(&self, axis: &str) -> Result<&[Value], ConfigError> {
        let value = self.require(axis)?;
        value
            .as_tuple()
            .ok_or_else(|| Self::mismatch(axis, "tuple", value))
    }
}

type ResolveFn = Box<dyn Fn(&Assignment) -> Vec<Value> + Send + Sync>;
type FilterFn = Box<dyn Fn(&Assignment) -> bool + Send + Sync>;

enum AxisSource {
    Values(Vec<Value>),
    Derived { after: Vec<String>, resolve: ResolveFn },
}

struct Axis {
    name: String,
    source: AxisSource,
}

impl Axis {
    fn dependencies(&self) -> &[String] {
        match &self.source {
            AxisSource::Values(_) => &[],
            AxisSource::Derived { after, .. } => after,
        }
    }
}

struct Filter {
    needs: Vec<String>,
    keep: FilterFn,
}

/// The declarative configuration space of a sweep.
#[derive(Default)]
pub struct AxisSet {
    axes: Vec<Axis>,
    filters: Vec<Filter>,
}

impl AxisSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an independent axis.
    pub fn axis<V: Into<Value>>(mut self, name: &str, values: impl IntoIterator<Item = V>) -> Self {
        self.axes.push(Axis {
            name: name.to_string(),
            source: AxisSource::Values(values.into_iter().map(Into::into).collect()),
        });
        self
    }

    /// Adds an axis whose values are computed from the axes listed in `after`. The resolver only
    /// sees those axes (plus anything bound earlier) and may return several values, each of which
    /// becomes its own combination.
    pub fn derived<F>(mut self, name: &str, after: &[&str], resolve: F) -> Self
    where
        F: Fn(&Assignment) -> Vec<Value> + Send + Sync + 'static,
    {
        self.axes.push(Axis {
            name: name.to_string(),
            source: AxisSource::Derived {
                after: after.iter().map(|s| s.to_string()).collect(),
                resolve: Box::new(resolve),
            },
        });
        self
    }

    /// Keeps only combinations for which `keep` returns true. `needs` lists the axes the
    /// predicate reads.
    pub fn filter<F>(mut self, needs: &[&str], keep: F) -> Self
    where
        F: Fn(&Assignment) -> bool + Send + Sync + 'static,
    {
        self.filters.push(Filter {
            needs: needs.iter().map(|s| s.to_string()).collect(),
            keep: Box::new(keep),
        });
        self
    }

    fn validate(&self) -> Result<HashMap<&str, usize>, ConfigError> {
        let mut positions = HashMap::new();
        for (i, axis) in self.axes.iter().enumerate() {
            if positions.insert(axis.name.as_str(), i).is_some() {
                return Err(ConfigError::DuplicateAxis(axis.name.clone()));
            }
        }

        for axis in self.axes.iter() {
            for dep in axis.dependencies() {
                if !positions.contains_key(dep.as_str()) {
                    return Err(ConfigError::UnknownAxis {
                        axis: dep.clone(),
                        referenced_by: axis.name.clone(),
                    });
                }
            }
        }

        for filter in self.filters.iter() {
            for need in filter.needs.iter() {
                if !positions.contains_key(need.as_str()) {
                    return Err(ConfigError::UnknownAxis {
                        axis: need.clone(),
                        referenced_by: "filter".to_string(),
                    });
                }
            }
        }

        Ok(positions)
    }

    /// Orders axes for binding: independent axes first in declaration order, then derived axes
    /// in a stable topological order. Returns indices into `self.axes`.
    fn binding_order(&self, positions: &HashMap<&str, usize>) -> Result<Vec<usize>, ConfigError> {
        let mut order: Vec<usize> = self
            .axes
            .iter()
            .enumerate()
            .filter(|(_, axis)| matches!(axis.source, AxisSource::Values(_)))
            .map(|(i, _)| i)
            .collect();
        let mut placed = vec![false; self.axes.len()];
        for &i in order.iter() {
            placed[i] = true;
        }

        loop {
            let next = self.axes.iter().enumerate().find(|(i, axis)| {
                !placed[*i]
                    && axis
                        .dependencies()
                        .iter()
                        .all(|dep| placed[positions[dep.as_str()]])
            });
            match next {
                Some((i, _)) => {
                    placed[i] = true;
                    order.push(i);
                }
                None => break,
            }
        }

        if order.len() < self.axes.len() {
            let stuck = self
                .axes
                .iter()
                .enumerate()
                .filter(|(i, _)| !placed[*i])
                .map(|(_, axis)| axis.name.as_str())
                .join(", ");
            return Err(ConfigError::CyclicAxes(stuck));
        }

        Ok(order)
    }

    /// Expands the axis set into every valid combination, repeated `replication` times.
    pub fn expand(&self, replication: usize) -> Result<Vec<Assignment>, ConfigError> {
        if replication == 0 {
            return Err(ConfigError::InvalidReplication);
        }

        let positions = self.validate()?;
        let order = self.binding_order(&positions)?;

        // a filter runs as soon as the last axis it needs has been bound
        let mut filters_at: Vec<Vec<&Filter>> = vec![vec![]; order.len() + 1];
        for filter in self.filters.iter() {
            let depth = filter
                .needs
                .iter()
                .map(|need| {
                    let axis = positions[need.as_str()];
                    order.iter().position(|&o| o == axis).unwrap_or(0) + 1
                })
                .max()
                .unwrap_or(0);
            filters_at[depth].push(filter);
        }

        let mut found = vec![];
        let mut bound = vec![];
        if filters_at[0].iter().all(|f| (f.keep)(&Assignment(vec![]))) {
            self.bind(&order, &filters_at, 0, &mut bound, &mut found);
        }

        // restore declaration order: sort by value index per declared axis
        found.sort_by(|a, b| a.0.cmp(&b.0));
        let pass = found.into_iter().map(|(_, a)| a).collect_vec();

        let mut assignments = Vec::with_capacity(pass.len() * replication);
        for _ in 0..replication {
            assignments.extend(pass.iter().cloned());
        }
        Ok(assignments)
    }

    fn bind(
        &self,
        order: &[usize],
        filters_at: &[Vec<&Filter>],
        depth: usize,
        bound: &mut Vec<(usize, usize, Value)>,
        found: &mut Vec<(Vec<usize>, Assignment)>,
    ) {
        if depth == order.len() {
            let mut key = vec![0; self.axes.len()];
            for (axis, value_index, _) in bound.iter() {
                key[*axis] = *value_index;
            }
            found.push((key, self.assignment_in_declaration_order(bound)));
            return;
        }

        let axis_index = order[depth];
        let axis = &self.axes[axis_index];
        let values = match &axis.source {
            AxisSource::Values(values) => values.clone(),
            AxisSource::Derived { resolve, .. } => resolve(&self.assignment_in_binding_order(bound)),
        };

        for (value_index, value) in values.into_iter().enumerate() {
            bound.push((axis_index, value_index, value));
            let partial = self.assignment_in_binding_order(bound);
            if filters_at[depth + 1].iter().all(|f| (f.keep)(&partial)) {
                self.bind(order, filters_at, depth + 1, bound, found);
            }
            bound.pop();
        }
    }

    fn assignment_in_binding_order(&self, bound: &[(usize, usize, Value)]) -> Assignment {
        Assignment(
            bound
                .iter()
                .map(|(axis, _, value)| (self.axes[*axis].name.clone(), value.clone()))
                .collect(),
        )
    }

    fn assignment_in_declaration_order(&self, bound: &[(usize, usize, Value)]) -> Assignment {
        let mut pairs = bound.to_vec();
        pairs.sort_by_key(|(axis, _, _)| *axis);
        Assignment(
            pairs
                .into_iter()
                .map(|(axis, _, value)| (self.axes[axis].name.clone(), value))
                .collect(),
        )
    }
}

type BuildFn = Box<dyn Fn(&Assignment) -> Result<TrialInput, ConfigError> + Send + Sync>;

/// One entry of an expanded sweep.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedTrial {
    pub index: usize,
    pub repetition: usize,
    pub assignment: Assignment,
    pub input: TrialInput,
}

/// A named sweep: axes, replication count, how an assignment becomes a trial input and what the
/// summary table shows.
pub struct Sweep {
    pub name: String,
    axes: AxisSet,
    replication: usize,
    build: BuildFn,
    projection: Projection,
}

impl Sweep {
    pub fn new<F>(
        name: &str,
        axes: AxisSet,
        replication: usize,
        build: F,
        projection: Projection,
    ) -> Self
    where
        F: Fn(&Assignment) -> Result<TrialInput, ConfigError> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            axes,
            replication,
            build: Box::new(build),
            projection,
        }
    }

    pub fn projection(&self) -> &Projection {
        &self.projection
    }

    /// Returns a copy of this sweep with a different replication count.
    pub fn with_replication(self, replication: usize) -> Self {
        Self {
            replication,
            ..self
        }
    }

    pub fn plan(&self) -> Result<Vec<PlannedTrial>, ConfigError> {
        let assignments = self.axes.expand(self.replication)?;
        let per_pass = assignments.len() / self.replication;

        assignments
            .into_iter()
            .enumerate()
            .map(|(index, assignment)| {
                let input = (self.build)(&assignment)?;
                Ok(PlannedTrial {
                    index,
                    repetition: if per_pass == 0 { 0 } else { index / per_pass },
                    assignment,
                    input,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(assignments: &[Assignment], axis: &str) -> Vec<Value> {
        assignments
            .iter()
            .map(|a| a.get(axis).cloned().expect("axis should be bound"))
            .collect()
    }

    #[test]
    fn product_size_is_replication_times_axis_sizes() -> anyhow::Result<()> {
        let axes = AxisSet::new()
            .axis("f", [1, 2])
            .axis("keys", [1, 10, 100])
            .axis("thrifty", [true, false]);

        let assignments = axes.expand(3)?;
        assert_eq!(assignments.len(), 3 * 2 * 3 * 2);

        let pass = &assignments[..12];
        assert_eq!(
            values(pass, "f"),
            [1, 1, 1, 1, 1, 1, 2, 2, 2, 2, 2, 2].map(Value::from).to_vec()
        );
        assert_eq!(
            values(&pass[..6], "keys"),
            [1, 1, 10, 10, 100, 100].map(Value::from).to_vec()
        );
        assert_eq!(&assignments[12..24], pass);
        assert_eq!(&assignments[24..], pass);
        Ok(())
    }

    #[test]
    fn filtered_combinations_never_appear() -> anyhow::Result<()> {
        let axes = AxisSet::new()
            .axis("f", [1, 2, 3])
            .axis("clients", [1, 5])
            .filter(&["f", "clients"], |a| {
                !(a.int("f").unwrap_or(0) == 2 && a.int("clients").unwrap_or(0) == 5)
            });

        for replication in 1..4 {
            let assignments = axes.expand(replication)?;
            assert_eq!(assignments.len(), 5 * replication);
            assert!(assignments.iter().all(|a| !(a.get("f") == Some(&Value::Int(2))
                && a.get("clients") == Some(&Value::Int(5)))));
        }
        Ok(())
    }

    #[test]
    fn derived_axis_takes_max_of_floor_and_double() -> anyhow::Result<()> {
        let axes = AxisSet::new()
            .axis("wait_period", [0.0, 0.1, 1.0, 10.0])
            .derived("repropose_period", &["wait_period"], |a| {
                let wait = a.float("wait_period").unwrap_or(0.0);
                vec![Value::from(f64::max(50.0, wait * 2.0))]
            });

        let assignments = axes.expand(1)?;
        assert_eq!(
            values(&assignments, "repropose_period"),
            vec![Value::Float(50.0); 4]
        );

        let wide = AxisSet::new()
            .axis("wait_period", [10.0, 30.0])
            .derived("repropose_period", &["wait_period"], |a| {
                vec![Value::from(f64::max(50.0, a.float("wait_period").unwrap_or(0.0) * 2.0))]
            });
        assert_eq!(
            values(&wide.expand(1)?, "repropose_period"),
            vec![Value::Float(50.0), Value::Float(60.0)]
        );
        Ok(())
    }

    #[test]
    fn derived_axes_keep_declaration_order() -> anyhow::Result<()> {
        // `wait` is declared before the independent `clients` axis but depends on `rs`
        let axes = AxisSet::new()
            .axis("rs", ["classic", "mixed"])
            .derived("wait", &["rs"], |a| match a.str("rs") {
                Ok("classic") => vec![Value::from(0.0)],
                _ => vec![Value::from(0.1), Value::from(1.0)],
            })
            .axis("clients", [1, 10]);

        let assignments = axes.expand(1)?;
        let rows = assignments
            .iter()
            .map(|a| a.iter().map(|(_, v)| v.to_string()).join("/"))
            .collect_vec();
        assert_eq!(
            rows,
            [
                "classic/0/1",
                "classic/0/10",
                "mixed/0.1/1",
                "mixed/0.1/10",
                "mixed/1/1",
                "mixed/1/10",
            ]
        );
        Ok(())
    }

    #[test]
    fn independent_filters_run_before_resolvers() -> anyhow::Result<()> {
        let axes = AxisSet::new()
            .axis("f", [0, 1])
            .derived("replicas", &["f"], |a| {
                let f = a.int("f").unwrap_or(0);
                assert!(f > 0, "resolver must never see filtered combinations");
                vec![Value::from(2 * f + 1)]
            })
            .filter(&["f"], |a| a.int("f").unwrap_or(0) > 0);

        let assignments = axes.expand(1)?;
        assert_eq!(values(&assignments, "replicas"), vec![Value::Int(3)]);
        Ok(())
    }

    #[test]
    fn cyclic_dependencies_are_rejected() {
        let axes = AxisSet::new()
            .derived("a", &["b"], |_| vec![Value::from(1)])
            .derived("b", &["a"], |_| vec![Value::from(1)]);

        match axes.expand(1) {
            Err(ConfigError::CyclicAxes(names)) => assert_eq!(names, "a, b"),
            other => panic!("expected a cycle, got {:?}", other.map(|a| a.len())),
        }
    }

    #[test]
    fn unknown_dependencies_and_zero_replication_are_rejected() {
        let axes = AxisSet::new().derived("a", &["missing"], |_| vec![]);
        assert!(matches!(
            axes.expand(1),
            Err(ConfigError::UnknownAxis { .. })
        ));

        let axes = AxisSet::new().axis("f", [1]);
        assert!(matches!(
            axes.expand(0),
            Err(ConfigError::InvalidReplication)
        ));

        let axes = AxisSet::new().axis("f", [1]).axis("f", [2]);
        assert!(matches!(axes.expand(1), Err(ConfigError::DuplicateAxis(_))));
    }

    #[test]
    fn expansion_is_deterministic() -> anyhow::Result<()> {
        let make = || {
            AxisSet::new()
                .axis("n", [1, 10, 20, 30])
                .axis("rs", ["classic", "mixed"])
                .derived("wait", &["rs"], |a| match a.str("rs") {
                    Ok("classic") => vec![Value::from((0.0, 0.0))],
                    _ => vec![Value::from((0.01, 0.0)), Value::from((10.0, 0.0))],
                })
        };

        let first = serde_json::to_string(&make().expand(3)?)?;
        let second = serde_json::to_string(&make().expand(3)?)?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn typed_accessors_report_mismatches() -> anyhow::Result<()> {
        let assignments = AxisSet::new().axis("f", ["one"]).expand(1)?;
        assert!(matches!(
            assignments[0].int("f"),
            Err(ConfigError::AxisType { .. })
        ));
        assert_eq!(assignments[0].str("f")?, "one");
        Ok(())
    }
}
