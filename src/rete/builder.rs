//! Recipe instantiation.
//!
//! [`ReteBuilder`] turns [`ReteRecipe`] trees into network nodes,
//! bottom-up, reusing a node for every recipe it has already built. Input
//! nodes created on the way are seeded from the model; every other stateful
//! node pulls its parent's content when it is created.

use super::recipe::ReteRecipe;
use super::{Direction, Network, NodeId};
use crate::catalog::QueryCatalog;
use crate::error::{PlanError, PlanResult};
use crate::model::ModelIndex;
use std::collections::HashMap;

/// Lookups needed while building
#[derive(Clone, Copy)]
pub struct BuildContext<'a> {
    pub catalog: &'a QueryCatalog,
    pub model: &'a dyn ModelIndex,
    /// Production node of every query already allocated
    pub productions: &'a HashMap<String, NodeId>,
}

#[derive(Debug, Default)]
pub struct ReteBuilder {
    cache: HashMap<ReteRecipe, NodeId>,
}

impl ReteBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct recipes instantiated so far
    pub fn cached_nodes(&self) -> usize {
        self.cache.len()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// Node producing `recipe`, built on first request
    pub fn build(
        &mut self,
        network: &mut Network,
        recipe: &ReteRecipe,
        ctx: &BuildContext<'_>,
    ) -> PlanResult<NodeId> {
        if let Some(&id) = self.cache.get(recipe) {
            return Ok(id);
        }

        let id = match recipe {
            // never cached: the production may be allocated after this
            // recipe was first seen
            ReteRecipe::Production { query, .. } => {
                return ctx
                    .productions
                    .get(query)
                    .copied()
                    .ok_or_else(|| PlanError::UnknownQuery(query.clone()));
            }
            ReteRecipe::Constant { tuples, arity } => network.add_constant(tuples.clone(), *arity),
            ReteRecipe::Input { key } => {
                let fresh = network.input_node(key).is_none();
                let unique = ctx.model.metamodel().is_unique_key(key);
                let id = network.add_input(key.clone(), key.arity(), unique);
                if fresh {
                    let tuples = ctx.model.tuples(key);
                    tracing::debug!(key = %key, tuples = tuples.len(), "input_node_seeded");
                    for tuple in tuples {
                        network.update_input(key, Direction::Insert, tuple);
                    }
                }
                id
            }
            ReteRecipe::Trim { parent, mask } => {
                let parent = self.build(network, parent, ctx)?;
                network.add_trimmer(parent, mask.clone())
            }
            ReteRecipe::ConstantFilter {
                parent,
                column,
                value,
            } => {
                let parent = self.build(network, parent, ctx)?;
                network.add_constant_filter(parent, *column, value.clone())
            }
            ReteRecipe::EqualityFilter { parent, groups } => {
                let parent = self.build(network, parent, ctx)?;
                network.add_equality_filter(parent, groups.clone())
            }
            ReteRecipe::InequalityFilter {
                parent,
                left,
                right,
            } => {
                let parent = self.build(network, parent, ctx)?;
                network.add_inequality_filter(parent, *left, *right)
            }
            ReteRecipe::Expression {
                parent,
                evaluator,
                inputs,
                mode,
            } => {
                let evaluator = ctx.catalog.evaluator(evaluator)?;
                let parent = self.build(network, parent, ctx)?;
                network.add_expression(parent, evaluator, inputs.clone(), *mode)
            }
            ReteRecipe::Join {
                primary,
                primary_mask,
                secondary,
                secondary_mask,
            } => {
                let primary = self.build(network, primary, ctx)?;
                let secondary = self.build(network, secondary, ctx)?;
                network.add_join(
                    primary,
                    primary_mask.clone(),
                    secondary,
                    secondary_mask.clone(),
                )
            }
            ReteRecipe::Existence {
                primary,
                primary_mask,
                secondary,
                secondary_mask,
                negative,
            } => {
                let primary = self.build(network, primary, ctx)?;
                let secondary = self.build(network, secondary, ctx)?;
                network.add_existence(
                    primary,
                    primary_mask.clone(),
                    secondary,
                    secondary_mask.clone(),
                    *negative,
                )
            }
            ReteRecipe::OuterJoin {
                primary,
                primary_mask,
                secondary,
                secondary_mask,
                defaults,
            } => {
                let primary = self.build(network, primary, ctx)?;
                let secondary = self.build(network, secondary, ctx)?;
                network.add_outer_join(
                    primary,
                    primary_mask.clone(),
                    secondary,
                    secondary_mask.clone(),
                    defaults.clone(),
                )
            }
            ReteRecipe::Aggregate {
                parent,
                group_mask,
                operator,
                column,
            } => {
                let operator = ctx.catalog.aggregator(operator)?;
                let parent = self.build(network, parent, ctx)?;
                network.add_aggregator(parent, group_mask.clone(), operator, *column)
            }
            ReteRecipe::TransitiveClosure { parent } => {
                let parent = self.build(network, parent, ctx)?;
                network.add_transitive_closure(parent)
            }
        };
        self.cache.insert(recipe.clone(), id);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rete::node::ExpressionMode;
    use crate::model::{InMemoryModel, InputKey, Metamodel};
    use crate::value::{Mask, Value};
    use std::sync::Arc;

    fn edge() -> Arc<ReteRecipe> {
        Arc::new(ReteRecipe::Input {
            key: InputKey::feature("edge"),
        })
    }

    #[test]
    fn test_shared_subrecipes_build_once() {
        let catalog = QueryCatalog::new();
        let model = InMemoryModel::new(Metamodel::new());
        let productions = HashMap::new();
        let ctx = BuildContext {
            catalog: &catalog,
            model: &model,
            productions: &productions,
        };
        let mut network = Network::new();
        let mut builder = ReteBuilder::new();

        let trim = ReteRecipe::Trim {
            parent: edge(),
            mask: Mask::new(vec![1], 2),
        };
        let a = builder.build(&mut network, &trim, &ctx).unwrap();
        let b = builder.build(&mut network, &trim.clone(), &ctx).unwrap();
        assert_eq!(a, b);
        assert_eq!(network.node_count(), 2);
        assert_eq!(builder.cached_nodes(), 2);
    }

    #[test]
    fn test_new_input_is_seeded_from_model() {
        let catalog = QueryCatalog::new();
        let mut model = InMemoryModel::new(Metamodel::new());
        let a = Value::Object(model.create_object("A"));
        let b = Value::Object(model.create_object("A"));
        model.add_value(&a, "edge", b.clone());
        model.drain_changes();

        let productions = HashMap::new();
        let ctx = BuildContext {
            catalog: &catalog,
            model: &model,
            productions: &productions,
        };
        let mut network = Network::new();
        let id = ReteBuilder::new().build(&mut network, &edge(), &ctx).unwrap();
        assert_eq!(network.pull(id).len(), 1);
    }

    #[test]
    fn test_unknown_production_and_evaluator() {
        let catalog = QueryCatalog::new();
        let model = InMemoryModel::new(Metamodel::new());
        let productions = HashMap::new();
        let ctx = BuildContext {
            catalog: &catalog,
            model: &model,
            productions: &productions,
        };
        let mut network = Network::new();
        let mut builder = ReteBuilder::new();
        let call = ReteRecipe::Production {
            query: "q".into(),
            arity: 1,
        };
        assert_eq!(
            builder.build(&mut network, &call, &ctx),
            Err(PlanError::UnknownQuery("q".into()))
        );
        let check = ReteRecipe::Expression {
            parent: edge(),
            evaluator: "nope".into(),
            inputs: vec![0],
            mode: ExpressionMode::Check,
        };
        assert_eq!(
            builder.build(&mut network, &check, &ctx),
            Err(PlanError::UnknownEvaluator("nope".into()))
        );
    }
}
