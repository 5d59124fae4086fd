//! The preprocessor registry.
//!
//! Route definitions carry typed callable descriptors; the host process
//! registers implementations under the matching keys during startup.
//! Preprocessors receive the current parameter map and a context, and
//! return a replacement map or `None` to keep the current one. They must
//! not mutate the route definition.

use std::sync::{Arc, RwLock};

use ahash::AHashMap;

use crate::common::RequestMeta;
use crate::error::ExecutionError;
use crate::route::{ParamMap, RouteDefinition, TomlMap};

/// Context handed to every preprocess step.
pub struct PreprocessContext<'a> {
    pub route: &'a RouteDefinition,
    pub options: &'a TomlMap,
    pub request: Option<&'a RequestMeta>,
}

pub type PreprocessFn =
    dyn Fn(ParamMap, &PreprocessContext) -> Result<Option<ParamMap>, ExecutionError> + Send + Sync;

#[derive(Default)]
pub struct PreprocessRegistry {
    callables: RwLock<AHashMap<String, Arc<PreprocessFn>>>,
}

impl PreprocessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an implementation under a descriptor's registry key
    /// (see [`crate::route::CallableDescriptor::registry_key`]).
    pub fn register<F>(&self, key: impl Into<String>, callable: F)
    where
        F: Fn(ParamMap, &PreprocessContext) -> Result<Option<ParamMap>, ExecutionError>
            + Send
            + Sync
            + 'static,
    {
        self.callables
            .write()
            .expect("Preprocess registry should not be poisoned.")
            .insert(key.into(), Arc::new(callable));
    }

    fn get(&self, key: &str) -> Option<Arc<PreprocessFn>> {
        self.callables
            .read()
            .expect("Preprocess registry should not be poisoned.")
            .get(key)
            .cloned()
    }

    /// Run a route's preprocess chain over the coerced parameters.
    /// Any failure surfaces as `preprocess_error`.
    pub fn run_chain(
        &self,
        route: &RouteDefinition,
        params: ParamMap,
        request: Option<&RequestMeta>,
    ) -> Result<ParamMap, ExecutionError> {
        let mut current = params;

        for step in &route.preprocess {
            let key = step.callable.registry_key();

            let callable = self.get(&key).ok_or_else(|| ExecutionError::Preprocess {
                name: step.callable.name.clone(),
                detail: format!("no preprocessor is registered for '{key}'"),
            })?;

            let context = PreprocessContext {
                route,
                options: &step.options,
                request,
            };

            match callable(current.clone(), &context) {
                Ok(Some(next)) => current = next,
                Ok(None) => {}
                Err(err @ ExecutionError::Preprocess { .. }) => return Err(err),
                Err(other) => {
                    return Err(ExecutionError::Preprocess {
                        name: step.callable.name.clone(),
                        detail: other.to_string(),
                    })
                }
            }
        }

        Ok(current)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::route::*;

    fn route_with_steps(steps: Vec<PreprocessStep>) -> RouteDefinition {
        RouteDefinition {
            id: "r".into(),
            path: "/r".into(),
            methods: vec![Method::Get],
            raw_sql: "SELECT 1".into(),
            prepared_sql: "SELECT 1".into(),
            param_order: Vec::new(),
            params: Vec::new(),
            constants: Default::default(),
            preprocess: steps,
            uses: Vec::new(),
            cache: None,
            cache_mode: CacheMode::Materialize,
            overrides: None,
            append: None,
            metadata: TomlMap::default(),
        }
    }

    fn step(module: &str, name: &str) -> PreprocessStep {
        PreprocessStep {
            callable: CallableDescriptor {
                name: name.into(),
                source: CallableSource::Module(module.into()),
            },
            options: TomlMap::default(),
        }
    }

    #[test]
    fn chain_applies_in_order() {
        let registry = PreprocessRegistry::new();

        registry.register("module:demo::stamp", |mut params: ParamMap, _ctx: &PreprocessContext| {
            params.insert("stamped".into(), ParamValue::Bool(true));
            Ok(Some(params))
        });
        registry.register("module:demo::keep", |_params, _ctx: &PreprocessContext| Ok(None));

        let route = route_with_steps(vec![step("demo", "stamp"), step("demo", "keep")]);
        let out = registry.run_chain(&route, ParamMap::new(), None).unwrap();

        assert_eq!(out.get("stamped"), Some(&ParamValue::Bool(true)));
    }

    #[test]
    fn unregistered_step_is_a_preprocess_error() {
        let registry = PreprocessRegistry::new();
        let route = route_with_steps(vec![step("demo", "missing")]);

        let err = registry.run_chain(&route, ParamMap::new(), None).unwrap_err();
        assert_eq!(err.code(), "preprocess_error");
    }

    #[test]
    fn step_failures_are_wrapped() {
        let registry = PreprocessRegistry::new();
        registry.register("module:demo::boom", |_params, _ctx: &PreprocessContext| {
            Err(ExecutionError::Internal {
                detail: "exploded".into(),
            })
        });

        let route = route_with_steps(vec![step("demo", "boom")]);
        let err = registry.run_chain(&route, ParamMap::new(), None).unwrap_err();

        assert_eq!(err.code(), "preprocess_error");
        assert!(err.to_string().contains("exploded"));
    }
}
