//! Validador estructural del grafo compilado.
//!
//! - Alcanzabilidad: todo nodo declarado debe alcanzarse desde ENTRY
//!   siguiendo cualquier arista (sucesor por defecto, casos de branch,
//!   targets `on_*`).
//! - Ciclos: un ciclo es admisible sólo si contiene un nodo bloqueante
//!   (`collect`/`confirm`), porque entre dos nodos no bloqueantes el turno no
//!   consume input y el ciclo giraría sin freno. Se detecta por componentes
//!   fuertemente conexas.

use std::collections::HashSet;

use crate::errors::CompileError;
use crate::graph::{FlowGraph, NodeId, NodeKind, Target};

pub fn validate_graph(graph: &FlowGraph) -> Result<(), CompileError> {
    check_reachability(graph)?;
    check_cycles(graph)
}

fn node_successors(graph: &FlowGraph, id: NodeId) -> Vec<NodeId> {
    graph.successors(id)
         .into_iter()
         .filter_map(|t| match t {
             Target::Node(n) => Some(n),
             _ => None,
         })
         .collect()
}

fn check_reachability(graph: &FlowGraph) -> Result<(), CompileError> {
    let mut visited: HashSet<NodeId> = HashSet::new();
    // Raíces: ENTRY más el on_error de flujo (sus steps se alcanzan sólo
    // por la ruta de error).
    let mut stack = vec![graph.entry];
    if let Some(Target::Node(id)) = graph.on_error {
        stack.push(id);
    }
    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        for next in node_successors(graph, id) {
            stack.push(next);
        }
    }

    for (step_id, node_id) in &graph.by_step {
        if !visited.contains(node_id) {
            return Err(CompileError::UnreachableNode { flow: graph.flow_name.clone(),
                                                       step: step_id.clone() });
        }
    }
    Ok(())
}

/// SCCs de Tarjan; cada componente cíclica (más de un nodo, o un nodo con
/// lazo propio) debe contener al menos un nodo bloqueante.
fn check_cycles(graph: &FlowGraph) -> Result<(), CompileError> {
    let n = graph.nodes.len();
    let mut state = Tarjan { graph,
                             index: vec![None; n],
                             lowlink: vec![0; n],
                             on_stack: vec![false; n],
                             stack: Vec::new(),
                             next_index: 0,
                             components: Vec::new() };
    for id in 0..n {
        if state.index[id].is_none() {
            state.strongconnect(id);
        }
    }

    for component in &state.components {
        let cyclic = component.len() > 1
                     || component.iter()
                                 .any(|&id| node_successors(graph, id).contains(&id));
        if !cyclic {
            continue;
        }
        let has_blocking = component.iter().any(|&id| graph.nodes[id].kind.is_blocking());
        if !has_blocking {
            let mut cycle: Vec<String> = component.iter()
                                                  .map(|&id| graph.nodes[id].step_id.clone())
                                                  .collect();
            cycle.sort();
            return Err(CompileError::UnsafeCycle { flow: graph.flow_name.clone(),
                                                   cycle });
        }
    }
    Ok(())
}

struct Tarjan<'a> {
    graph: &'a FlowGraph,
    index: Vec<Option<usize>>,
    lowlink: Vec<usize>,
    on_stack: Vec<bool>,
    stack: Vec<NodeId>,
    next_index: usize,
    components: Vec<Vec<NodeId>>,
}

impl<'a> Tarjan<'a> {
    fn strongconnect(&mut self, v: NodeId) {
        self.index[v] = Some(self.next_index);
        self.lowlink[v] = self.next_index;
        self.next_index += 1;
        self.stack.push(v);
        self.on_stack[v] = true;

        for w in node_successors(self.graph, v) {
            if self.index[w].is_none() {
                self.strongconnect(w);
                self.lowlink[v] = self.lowlink[v].min(self.lowlink[w]);
            } else if self.on_stack[w] {
                self.lowlink[v] = self.lowlink[v].min(self.index[w].unwrap_or(0));
            }
        }

        if Some(self.lowlink[v]) == self.index[v] {
            let mut component = Vec::new();
            while let Some(w) = self.stack.pop() {
                self.on_stack[w] = false;
                component.push(w);
                if w == v {
                    break;
                }
            }
            self.components.push(component);
        }
    }
}
