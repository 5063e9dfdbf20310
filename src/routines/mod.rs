//! Routine Resolver (spec.md §4.4): expands `routine: <scope>.<name>`
//! references into inline step sequences with `params.*` bound from the
//! call site. Scopes resolve in order `global`, then `uc.<use-case-id>`.
//! Expansion is non-recursive — an expanded step that itself names a
//! routine is left unexpanded, by contract.

use std::collections::HashMap;

use crate::protocol::{Routine, Step};

#[derive(Debug, Default, Clone)]
pub struct RoutineSet {
    global: HashMap<String, Routine>,
    by_use_case: HashMap<String, HashMap<String, Routine>>,
}

impl RoutineSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_global(&mut self, name: impl Into<String>, routine: Routine) {
        self.global.insert(name.into(), routine);
    }

    pub fn insert_use_case(&mut self, use_case: impl Into<String>, name: impl Into<String>, routine: Routine) {
        self.by_use_case
            .entry(use_case.into())
            .or_default()
            .insert(name.into(), routine);
    }

    fn resolve(&self, reference: &str, current_use_case: &str) -> Result<&Routine, String> {
        if let Some(name) = reference.strip_prefix("global.") {
            return self
                .global
                .get(name)
                .ok_or_else(|| format!("unknown global routine `{name}`"));
        }
        if let Some(rest) = reference.strip_prefix("uc.") {
            let (use_case, name) = rest
                .split_once('.')
                .ok_or_else(|| format!("malformed routine reference `{reference}`"))?;
            let use_case = if use_case.is_empty() {
                current_use_case
            } else {
                use_case
            };
            return self
                .by_use_case
                .get(use_case)
                .and_then(|m| m.get(name))
                .ok_or_else(|| format!("unknown routine `{name}` in use case `{use_case}`"));
        }
        Err(format!(
            "routine reference `{reference}` must start with `global.` or `uc.`"
        ))
    }
}

/// Expand every `routine:` step in `steps` in place, producing a flat
/// step list the Test Runner can execute without further resolution.
pub fn flatten_phase(
    steps: &[Step],
    routines: &RoutineSet,
    current_use_case: &str,
) -> Result<Vec<Step>, String> {
    let mut out = Vec::with_capacity(steps.len());
    for step in steps {
        match &step.routine {
            Some(reference) => out.extend(expand_one(step, reference, routines, current_use_case)?),
            None => out.push(step.clone()),
        }
    }
    Ok(out)
}

fn expand_one(
    step: &Step,
    reference: &str,
    routines: &RoutineSet,
    current_use_case: &str,
) -> Result<Vec<Step>, String> {
    let routine = routines.resolve(reference, current_use_case)?;

    let mut bound = HashMap::new();
    for (name, declared) in &routine.params {
        match step.params.get(name).cloned().or_else(|| declared.default.clone()) {
            Some(value) => {
                bound.insert(name.clone(), value);
            }
            None if declared.required => {
                return Err(format!(
                    "missing required parameter `{name}` for routine `{reference}`"
                ));
            }
            None => {}
        }
    }

    Ok(routine
        .steps
        .iter()
        .cloned()
        .map(|mut s| {
            s.params_binding = Some(bound.clone());
            s
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RoutineParam;
    use serde_json::json;
    use std::collections::HashMap as Map;

    fn simple_step(name: &str) -> Step {
        Step {
            name: name.to_string(),
            handler: Some("shell".to_string()),
            routine: None,
            timeout: None,
            ignore_errors: false,
            capture: None,
            workdir: None,
            env: Default::default(),
            params: Default::default(),
            params_binding: None,
        }
    }

    fn routine_step(reference: &str, args: Map<String, serde_json::Value>) -> Step {
        Step {
            name: "call".to_string(),
            handler: None,
            routine: Some(reference.to_string()),
            timeout: None,
            ignore_errors: false,
            capture: None,
            workdir: None,
            env: Default::default(),
            params: args,
            params_binding: None,
        }
    }

    #[test]
    fn expands_global_routine_with_bound_params() {
        let mut routines = RoutineSet::new();
        let mut params = Map::new();
        params.insert(
            "greeting".to_string(),
            RoutineParam {
                param_type: "string".to_string(),
                required: true,
                default: None,
            },
        );
        routines.insert_global(
            "greet",
            Routine {
                description: None,
                params,
                steps: vec![simple_step("inner")],
            },
        );

        let mut args = Map::new();
        args.insert("greeting".to_string(), json!("hi"));
        let steps = vec![routine_step("global.greet", args)];

        let expanded = flatten_phase(&steps, &routines, "auth").unwrap();
        assert_eq!(expanded.len(), 1);
        assert_eq!(expanded[0].name, "inner");
        assert_eq!(
            expanded[0].params_binding.as_ref().unwrap().get("greeting"),
            Some(&json!("hi"))
        );
    }

    #[test]
    fn missing_required_param_fails() {
        let mut routines = RoutineSet::new();
        let mut params = Map::new();
        params.insert(
            "greeting".to_string(),
            RoutineParam {
                param_type: "string".to_string(),
                required: true,
                default: None,
            },
        );
        routines.insert_global(
            "greet",
            Routine {
                description: None,
                params,
                steps: vec![simple_step("inner")],
            },
        );

        let steps = vec![routine_step("global.greet", Map::new())];
        let err = flatten_phase(&steps, &routines, "auth").unwrap_err();
        assert!(err.contains("missing required parameter"));
    }

    #[test]
    fn use_case_scoped_routine() {
        let mut routines = RoutineSet::new();
        routines.insert_use_case(
            "auth",
            "login",
            Routine {
                description: None,
                params: Map::new(),
                steps: vec![simple_step("login_step")],
            },
        );
        let steps = vec![routine_step("uc.auth.login", Map::new())];
        let expanded = flatten_phase(&steps, &routines, "auth").unwrap();
        assert_eq!(expanded[0].name, "login_step");
    }
}
