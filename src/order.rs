//! Service start and stop ordering.
//!
//! `requires` is a hard dependency and widens the set of services acted on;
//! `after`/`before` only constrain scheduling order within that set. Cycle
//! detection runs over strongly connected components so that every member of
//! a loop can be named in the error.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::{error::PlanError, plan::Service};

/// Direction of an ordering request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Start,
    Stop,
}

/// Computes the order in which `names` (and everything they transitively
/// require) should be started.
pub fn start_order(
    services: &BTreeMap<String, Service>,
    names: &[String],
) -> Result<Vec<String>, PlanError> {
    order(services, names, Direction::Start)
}

/// Computes the order in which `names` (and everything that transitively
/// requires them) should be stopped.
pub fn stop_order(
    services: &BTreeMap<String, Service>,
    names: &[String],
) -> Result<Vec<String>, PlanError> {
    order(services, names, Direction::Stop)
}

fn order(
    services: &BTreeMap<String, Service>,
    names: &[String],
    direction: Direction,
) -> Result<Vec<String>, PlanError> {
    // Stop direction walks requires edges backwards: stopping a service
    // also stops the services that require it.
    let mut required_by: HashMap<&str, Vec<&str>> = HashMap::new();
    if direction == Direction::Stop {
        for (name, service) in services {
            for dependency in &service.requires {
                required_by
                    .entry(dependency.as_str())
                    .or_default()
                    .push(name.as_str());
            }
        }
    }

    let mut reachable: BTreeSet<String> = BTreeSet::new();
    let mut pending: Vec<String> = Vec::new();
    for name in names {
        if !services.contains_key(name) {
            return Err(PlanError::format(format!(
                "service \"{name}\" does not exist"
            )));
        }
        pending.push(name.clone());
    }
    while let Some(name) = pending.pop() {
        if !reachable.insert(name.clone()) {
            continue;
        }
        match direction {
            Direction::Start => {
                let service = &services[&name];
                for dependency in &service.requires {
                    if !services.contains_key(dependency) {
                        return Err(PlanError::format(format!(
                            "service \"{name}\" requires undefined service \"{dependency}\""
                        )));
                    }
                    pending.push(dependency.clone());
                }
            }
            Direction::Stop => {
                if let Some(dependents) = required_by.get(name.as_str()) {
                    pending.extend(dependents.iter().map(|d| d.to_string()));
                }
            }
        }
    }

    // Edges run from a service to the services scheduled after it. The
    // graph is restricted to the reachable set; sorted maps keep the
    // traversal, and hence the output, deterministic.
    let mut edges: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for name in &reachable {
        edges.entry(name.as_str()).or_default();
    }
    for name in &reachable {
        let service = &services[name];
        for earlier in &service.after {
            if reachable.contains(earlier) {
                match direction {
                    Direction::Start => {
                        edges.get_mut(earlier.as_str()).unwrap().insert(name);
                    }
                    Direction::Stop => {
                        edges.get_mut(name.as_str()).unwrap().insert(earlier);
                    }
                }
            }
        }
        for later in &service.before {
            if reachable.contains(later) {
                match direction {
                    Direction::Start => {
                        edges.get_mut(name.as_str()).unwrap().insert(later);
                    }
                    Direction::Stop => {
                        edges.get_mut(later.as_str()).unwrap().insert(name);
                    }
                }
            }
        }
    }

    let components = tarjan(&edges);

    let mut ordered = Vec::with_capacity(reachable.len());
    for component in components {
        if component.len() > 1 {
            let mut members: Vec<&str> = component.clone();
            members.sort_unstable();
            return Err(PlanError::format(format!(
                "services in before/after loop: {}",
                members.join(", ")
            )));
        }
        ordered.push(component[0].to_string());
    }
    Ok(ordered)
}

/// Tarjan's strongly-connected-components algorithm. Components come out in
/// reverse topological order, so the result is flipped before returning.
fn tarjan<'a>(edges: &BTreeMap<&'a str, BTreeSet<&'a str>>) -> Vec<Vec<&'a str>> {
    struct State<'a> {
        counter: usize,
        index: HashMap<&'a str, usize>,
        lowlink: HashMap<&'a str, usize>,
        on_stack: BTreeSet<&'a str>,
        stack: Vec<&'a str>,
        components: Vec<Vec<&'a str>>,
    }

    fn visit<'a>(
        node: &'a str,
        edges: &BTreeMap<&'a str, BTreeSet<&'a str>>,
        state: &mut State<'a>,
    ) {
        state.index.insert(node, state.counter);
        state.lowlink.insert(node, state.counter);
        state.counter += 1;
        state.stack.push(node);
        state.on_stack.insert(node);

        if let Some(successors) = edges.get(node) {
            for &next in successors {
                if !state.index.contains_key(next) {
                    visit(next, edges, state);
                    let next_low = state.lowlink[next];
                    let low = state.lowlink.get_mut(node).unwrap();
                    *low = (*low).min(next_low);
                } else if state.on_stack.contains(next) {
                    let next_index = state.index[next];
                    let low = state.lowlink.get_mut(node).unwrap();
                    *low = (*low).min(next_index);
                }
            }
        }

        if state.lowlink[node] == state.index[node] {
            let mut component = Vec::new();
            while let Some(member) = state.stack.pop() {
                state.on_stack.remove(member);
                component.push(member);
                if member == node {
                    break;
                }
            }
            component.reverse();
            state.components.push(component);
        }
    }

    let mut state = State {
        counter: 0,
        index: HashMap::new(),
        lowlink: HashMap::new(),
        on_stack: BTreeSet::new(),
        stack: Vec::new(),
        components: Vec::new(),
    };

    // Components always come out in reverse topological order; walking the
    // roots in reverse name order makes unconstrained services come out
    // name-sorted once the list is flipped.
    for &node in edges.keys().rev() {
        if !state.index.contains_key(node) {
            visit(node, edges, &mut state);
        }
    }

    state.components.reverse();
    state.components
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(
        requires: Vec<&str>,
        after: Vec<&str>,
        before: Vec<&str>,
    ) -> Service {
        Service {
            command: "true".into(),
            requires: requires.into_iter().map(String::from).collect(),
            after: after.into_iter().map(String::from).collect(),
            before: before.into_iter().map(String::from).collect(),
            ..Service::default()
        }
    }

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn start_order_follows_after_chain() {
        let mut services = BTreeMap::new();
        services.insert("a".to_string(), service(vec![], vec![], vec![]));
        services.insert("b".to_string(), service(vec!["a"], vec!["a"], vec![]));
        services.insert("c".to_string(), service(vec!["b"], vec!["b"], vec![]));

        let order = start_order(&services, &names(&["c"])).expect("order");
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn start_order_honors_before() {
        let mut services = BTreeMap::new();
        services.insert("a".to_string(), service(vec!["b"], vec![], vec!["b"]));
        services.insert("b".to_string(), service(vec![], vec![], vec![]));

        let order = start_order(&services, &names(&["a"])).expect("order");
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn start_order_ignores_relations_outside_set() {
        let mut services = BTreeMap::new();
        services.insert("a".to_string(), service(vec![], vec!["z"], vec![]));
        services.insert("z".to_string(), service(vec![], vec![], vec![]));

        // z is named in after but not required, so it is not pulled in.
        let order = start_order(&services, &names(&["a"])).expect("order");
        assert_eq!(order, vec!["a"]);
    }

    #[test]
    fn stop_order_reverses_start_order() {
        let mut services = BTreeMap::new();
        services.insert("a".to_string(), service(vec![], vec![], vec![]));
        services.insert("b".to_string(), service(vec!["a"], vec!["a"], vec![]));
        services.insert("c".to_string(), service(vec!["b"], vec!["b"], vec![]));

        let up = start_order(&services, &names(&["c"])).expect("start order");
        let down = stop_order(&services, &names(&["a"])).expect("stop order");

        let mut reversed = up.clone();
        reversed.reverse();
        assert_eq!(down, reversed);
    }

    #[test]
    fn stop_order_pulls_in_dependents() {
        let mut services = BTreeMap::new();
        services.insert("db".to_string(), service(vec![], vec![], vec![]));
        services.insert("web".to_string(), service(vec!["db"], vec!["db"], vec![]));

        let order = stop_order(&services, &names(&["db"])).expect("order");
        assert_eq!(order, vec!["web", "db"]);
    }

    #[test]
    fn cycle_reports_all_members() {
        let mut services = BTreeMap::new();
        services.insert("x".to_string(), service(vec![], vec!["y"], vec![]));
        services.insert("y".to_string(), service(vec![], vec!["z"], vec![]));
        services.insert("z".to_string(), service(vec![], vec!["x"], vec![]));

        let err = start_order(&services, &names(&["x", "y", "z"])).unwrap_err();
        assert_eq!(
            err.to_string(),
            "services in before/after loop: x, y, z"
        );
    }

    #[test]
    fn unknown_name_is_an_error() {
        let services = BTreeMap::new();
        let err = start_order(&services, &names(&["ghost"])).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn unconstrained_services_come_out_sorted() {
        let mut services = BTreeMap::new();
        for name in ["delta", "alpha", "charlie"] {
            services.insert(name.to_string(), service(vec![], vec![], vec![]));
        }

        let order =
            start_order(&services, &names(&["delta", "alpha", "charlie"])).expect("order");
        assert_eq!(order, vec!["alpha", "charlie", "delta"]);
    }
}
