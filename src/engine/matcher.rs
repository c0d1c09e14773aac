//! Query handles and match values.

use super::QueryEngine;
use crate::error::{EngineError, EngineResult, IntegrityIssue, PlanError};
use crate::model::ModelIndex;
use crate::planner::{Backend, PQuery};
use crate::value::{Tuple, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// One match of a query: a value per parameter
#[derive(Debug, Clone)]
pub struct Match {
    query: Arc<PQuery>,
    tuple: Tuple,
}

impl Match {
    pub(crate) fn new(query: Arc<PQuery>, tuple: Tuple) -> Self {
        Match { query, tuple }
    }

    pub fn query(&self) -> &str {
        &self.query.name
    }

    /// Value of the parameter called `name`
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.query
            .parameter_position(name)
            .and_then(|i| self.tuple.get(i))
    }

    pub fn get_at(&self, position: usize) -> Option<&Value> {
        self.tuple.get(position)
    }

    pub fn tuple(&self) -> &Tuple {
        &self.tuple
    }

    pub fn parameter_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.query.parameters.iter().map(|p| p.name.as_str())
    }
}

impl PartialEq for Match {
    fn eq(&self, other: &Self) -> bool {
        self.query.name == other.query.name && self.tuple == other.tuple
    }
}

impl Eq for Match {}

impl fmt::Display for Match {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.query.name)?;
        for (i, (p, v)) in self.query.parameters.iter().zip(&self.tuple).enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={v}", p.name)?;
        }
        write!(f, ")")
    }
}

/// Values fixed in advance for a match request.
///
/// Positions are given by parameter name or all at once positionally.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialMatch {
    named: Vec<(String, Value)>,
    positional: Option<Vec<Option<Value>>>,
}

impl PartialMatch {
    /// Nothing bound
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(mut self, parameter: &str, value: impl Into<Value>) -> Self {
        self.named.push((parameter.to_string(), value.into()));
        self
    }

    pub fn from_positions(values: Vec<Option<Value>>) -> Self {
        PartialMatch {
            named: Vec::new(),
            positional: Some(values),
        }
    }

    /// One entry per parameter of `query`
    pub(crate) fn resolve(&self, query: &PQuery) -> EngineResult<Vec<Option<Value>>> {
        let mut binding = match &self.positional {
            Some(values) if values.len() != query.arity() => {
                return Err(EngineError::BindingArity {
                    query: query.name.clone(),
                    expected: query.arity(),
                    actual: values.len(),
                })
            }
            Some(values) => values.clone(),
            None => vec![None; query.arity()],
        };
        for (name, value) in &self.named {
            let position = query.parameter_position(name).ok_or_else(|| {
                PlanError::UnknownVariable(format!("{name} is not a parameter of {}", query.name))
            })?;
            binding[position] = Some(value.clone());
        }
        Ok(binding)
    }
}

/// Conversion of a match into a user-defined record
pub trait FromMatch: Sized {
    fn from_match(matched: &Match) -> anyhow::Result<Self>;
}

/// Read access to the matches of one prepared query
pub struct Matcher<'e, M: ModelIndex> {
    engine: &'e QueryEngine<M>,
    query: Arc<PQuery>,
    backend: Backend,
}

impl<'e, M: ModelIndex> Matcher<'e, M> {
    pub(crate) fn new(engine: &'e QueryEngine<M>, query: Arc<PQuery>, backend: Backend) -> Self {
        Matcher {
            engine,
            query,
            backend,
        }
    }

    pub fn query(&self) -> &PQuery {
        &self.query
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Every match agreeing with `partial`
    pub fn all_matches(&self, partial: &PartialMatch) -> EngineResult<Vec<Match>> {
        let mut out = Vec::new();
        self.for_each_match(partial, |m| out.push(m.clone()))?;
        Ok(out)
    }

    pub fn one_match(&self, partial: &PartialMatch) -> EngineResult<Option<Match>> {
        Ok(self.all_matches(partial)?.into_iter().next())
    }

    pub fn has_match(&self, partial: &PartialMatch) -> EngineResult<bool> {
        Ok(self.count_matches(partial)? > 0)
    }

    pub fn count_matches(&self, partial: &PartialMatch) -> EngineResult<usize> {
        let mut count = 0;
        self.for_each_match(partial, |_| count += 1)?;
        Ok(count)
    }

    pub fn for_each_match(
        &self,
        partial: &PartialMatch,
        mut f: impl FnMut(&Match),
    ) -> EngineResult<()> {
        let binding = partial.resolve(&self.query)?;
        for tuple in self.engine.raw_matches(&self.query, self.backend, &binding)? {
            if let Some(m) = self.engine.to_match(&self.query, tuple) {
                f(&m);
            }
        }
        Ok(())
    }

    /// Distinct values of `parameter` over the matches agreeing with `partial`
    pub fn all_values_of(
        &self,
        parameter: &str,
        partial: &PartialMatch,
    ) -> EngineResult<BTreeSet<Value>> {
        let position = self.query.parameter_position(parameter).ok_or_else(|| {
            PlanError::UnknownVariable(format!(
                "{parameter} is not a parameter of {}",
                self.query.name
            ))
        })?;
        let mut values = BTreeSet::new();
        self.for_each_match(partial, |m| {
            if let Some(v) = m.get_at(position) {
                values.insert(v.clone());
            }
        })?;
        Ok(values)
    }

    /// Matches converted with [`FromMatch`]; failed conversions are
    /// reported as integrity issues and skipped
    pub fn typed_matches<T: FromMatch>(&self, partial: &PartialMatch) -> EngineResult<Vec<T>> {
        let mut out = Vec::new();
        self.for_each_match(partial, |m| match T::from_match(m) {
            Ok(typed) => out.push(typed),
            Err(e) => self.engine.report_issue(IntegrityIssue::BadlyTypedMatch {
                query: self.query.name.clone(),
                message: format!("{m}: {e}"),
            }),
        })?;
        Ok(out)
    }
}

impl<M: ModelIndex> fmt::Debug for Matcher<'_, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Matcher")
            .field("query", &self.query.name)
            .field("backend", &self.backend)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple;

    fn query() -> Arc<PQuery> {
        Arc::new(PQuery::new("p", &["x", "y"]))
    }

    #[test]
    fn test_match_accessors() {
        let m = Match::new(query(), tuple![1i64, "a"]);
        assert_eq!(m.get("x"), Some(&Value::Int64(1)));
        assert_eq!(m.get("z"), None);
        assert_eq!(m.get_at(1), Some(&Value::string("a")));
        assert_eq!(m.parameter_names().collect::<Vec<_>>(), vec!["x", "y"]);
        assert_eq!(m, Match::new(query(), tuple![1i64, "a"]));
    }

    #[test]
    fn test_partial_match_resolution() {
        let q = query();
        let binding = PartialMatch::new().bind("y", 3i64).resolve(&q).unwrap();
        assert_eq!(binding, vec![None, Some(Value::Int64(3))]);

        let err = PartialMatch::from_positions(vec![None]).resolve(&q).unwrap_err();
        assert!(matches!(err, EngineError::BindingArity { expected: 2, actual: 1, .. }));

        let err = PartialMatch::new().bind("nope", 1i64).resolve(&q).unwrap_err();
        assert!(matches!(err, EngineError::Plan(PlanError::UnknownVariable(_))));
    }
}
