//! Cálculo de rutas para una operación colectiva.
//!
//! Los árboles se arman por índice: con los ids ordenados de forma ascendente
//! (la raíz siempre en el índice 0), el nodo `i` tiene como hijos a
//! `i*k+1 ..= i*k+k`. Misma topología, mismo árbol.

use std::collections::{BTreeMap, BTreeSet};

use common::TaskId;

use crate::error::{CommsError, CommsResult};

/// Orígenes y destinos de una instancia de operación.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub sources: BTreeSet<TaskId>,
    pub destinations: BTreeSet<TaskId>,
    pub fan_out: u32,
}

impl Topology {
    pub fn new(
        sources: impl IntoIterator<Item = TaskId>,
        destinations: impl IntoIterator<Item = TaskId>,
        fan_out: u32,
    ) -> CommsResult<Self> {
        let topology = Self {
            sources: sources.into_iter().collect(),
            destinations: destinations.into_iter().collect(),
            fan_out,
        };
        if topology.sources.is_empty() {
            return Err(CommsError::InvalidTopology("sin orígenes".to_string()));
        }
        if topology.destinations.is_empty() {
            return Err(CommsError::InvalidTopology("sin destinos".to_string()));
        }
        if fan_out == 0 {
            return Err(CommsError::InvalidConfig("fan_out debe ser >= 1".to_string()));
        }
        Ok(topology)
    }

    pub fn all_tasks(&self) -> BTreeSet<TaskId> {
        self.sources.union(&self.destinations).copied().collect()
    }
}

/// Destinos inmediatos de un origen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routing {
    pub source: TaskId,
    pub downstream: BTreeSet<TaskId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterKind {
    /// Árbol desde el único origen hacia los destinos (broadcast).
    Tree,
    /// Árbol invertido: los orígenes suben hasta el único destino (reduce).
    InvertedTree,
    /// Cada origen habla directo con cada destino (gather, partition).
    Flat,
}

#[derive(Debug, Clone)]
pub struct Router {
    kind: RouterKind,
    root: Option<TaskId>,
    routing: BTreeMap<TaskId, Routing>,
    expected: BTreeMap<TaskId, BTreeSet<TaskId>>,
    destinations: BTreeSet<TaskId>,
}

/// Ordena la raíz primero y el resto ascendente.
fn layout(root: TaskId, others: &BTreeSet<TaskId>) -> Vec<TaskId> {
    let mut nodes = Vec::with_capacity(others.len() + 1);
    nodes.push(root);
    nodes.extend(others.iter().copied().filter(|id| *id != root));
    nodes
}

fn children(nodes: &[TaskId], index: usize, fan_out: usize) -> BTreeSet<TaskId> {
    let first = index * fan_out + 1;
    (first..first + fan_out)
        .filter_map(|i| nodes.get(i).copied())
        .collect()
}

fn parent_index(index: usize, fan_out: usize) -> Option<usize> {
    if index == 0 {
        None
    } else {
        Some((index - 1) / fan_out)
    }
}

impl Router {
    /// Árbol de broadcast con raíz en el único origen.
    pub fn tree(topology: &Topology) -> CommsResult<Self> {
        if topology.sources.len() != 1 {
            return Err(CommsError::InvalidConfig(format!(
                "un árbol de broadcast necesita un único origen, hay {}",
                topology.sources.len()
            )));
        }
        let root = *topology.sources.iter().next().unwrap_or(&0);
        let nodes = layout(root, &topology.destinations);
        let k = topology.fan_out as usize;

        let mut routing = BTreeMap::new();
        let mut expected = BTreeMap::new();
        for (i, node) in nodes.iter().enumerate() {
            routing.insert(
                *node,
                Routing {
                    source: *node,
                    downstream: children(&nodes, i, k),
                },
            );
            if let Some(p) = parent_index(i, k) {
                expected.insert(*node, BTreeSet::from([nodes[p]]));
            }
        }
        // broadcast in-place: la raíz se entrega a sí misma
        if topology.destinations.contains(&root) {
            expected.insert(root, BTreeSet::from([root]));
        }

        Ok(Self {
            kind: RouterKind::Tree,
            root: Some(root),
            routing,
            expected,
            destinations: topology.destinations.clone(),
        })
    }

    /// Árbol invertido con raíz en el único destino; los orígenes son las hojas y los
    /// nodos internos agregan parciales.
    pub fn inverted_tree(topology: &Topology) -> CommsResult<Self> {
        if topology.destinations.len() != 1 {
            return Err(CommsError::InvalidConfig(format!(
                "reduce admite un único destino, hay {}",
                topology.destinations.len()
            )));
        }
        let root = *topology.destinations.iter().next().unwrap_or(&0);
        let nodes = layout(root, &topology.sources);
        let k = topology.fan_out as usize;

        let mut routing = BTreeMap::new();
        let mut expected = BTreeMap::new();
        for (i, node) in nodes.iter().enumerate() {
            let kids = children(&nodes, i, k);
            let is_source = topology.sources.contains(node);

            if is_source {
                let downstream = match parent_index(i, k) {
                    Some(p) => BTreeSet::from([nodes[p]]),
                    None => BTreeSet::new(),
                };
                routing.insert(
                    *node,
                    Routing {
                        source: *node,
                        downstream,
                    },
                );
            }

            // la raíz y los nodos internos reciben de sus hijos y de sí mismos
            if i == 0 || !kids.is_empty() {
                let mut ids = kids;
                if is_source {
                    ids.insert(*node);
                }
                expected.insert(*node, ids);
            }
        }

        Ok(Self {
            kind: RouterKind::InvertedTree,
            root: Some(root),
            routing,
            expected,
            destinations: topology.destinations.clone(),
        })
    }

    /// Ruteo directo: cada origen a todos los destinos (sin fan-out).
    pub fn flat(topology: &Topology) -> Self {
        let routing = topology
            .sources
            .iter()
            .map(|s| {
                let downstream = topology
                    .destinations
                    .iter()
                    .copied()
                    .filter(|d| d != s)
                    .collect();
                (
                    *s,
                    Routing {
                        source: *s,
                        downstream,
                    },
                )
            })
            .collect();
        let expected = topology
            .destinations
            .iter()
            .map(|d| (*d, topology.sources.clone()))
            .collect();

        Self {
            kind: RouterKind::Flat,
            root: None,
            routing,
            expected,
            destinations: topology.destinations.clone(),
        }
    }

    pub fn kind(&self) -> RouterKind {
        self.kind
    }

    pub fn root(&self) -> Option<TaskId> {
        self.root
    }

    /// Hijos inmediatos (árbol), padre (árbol invertido) o todos los destinos (flat).
    /// Un origen fuera de la topología es un error de protocolo.
    pub fn downstream_of(&self, source: TaskId) -> CommsResult<&BTreeSet<TaskId>> {
        self.routing
            .get(&source)
            .map(|r| &r.downstream)
            .ok_or(CommsError::UnknownSource(source))
    }

    pub fn routings(&self) -> impl Iterator<Item = &Routing> {
        self.routing.values()
    }

    /// Para cada nodo que recibe: de quién tiene que llegar algo para cerrar una ronda.
    pub fn expected_ids(&self) -> &BTreeMap<TaskId, BTreeSet<TaskId>> {
        &self.expected
    }

    pub fn is_destination(&self, task: TaskId) -> bool {
        self.destinations.contains(&task)
    }

    pub fn destinations(&self) -> &BTreeSet<TaskId> {
        &self.destinations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count_appearances(router: &Router) -> BTreeMap<TaskId, usize> {
        let mut seen = BTreeMap::new();
        for r in router.routings() {
            assert!(!r.downstream.contains(&r.source));
            for d in &r.downstream {
                *seen.entry(*d).or_insert(0) += 1;
            }
        }
        seen
    }

    #[test]
    fn cada_destino_aparece_una_sola_vez_en_el_arbol() {
        for fan_out in 1..=4 {
            for n in 1..=17u32 {
                let topology = Topology::new([100], 0..n, fan_out).unwrap();
                let router = Router::tree(&topology).unwrap();
                let seen = count_appearances(&router);
                assert_eq!(seen.len(), n as usize, "k={fan_out} n={n}");
                assert!(seen.values().all(|c| *c == 1));
                assert_eq!(
                    seen.keys().copied().collect::<BTreeSet<_>>(),
                    topology.destinations
                );
            }
        }
    }

    #[test]
    fn arbol_binario_por_indices() {
        let topology = Topology::new([0], [0, 1, 2, 3, 4, 5, 6], 2).unwrap();
        let router = Router::tree(&topology).unwrap();
        assert_eq!(router.downstream_of(0).unwrap(), &BTreeSet::from([1, 2]));
        assert_eq!(router.downstream_of(1).unwrap(), &BTreeSet::from([3, 4]));
        assert_eq!(router.downstream_of(2).unwrap(), &BTreeSet::from([5, 6]));
        assert!(router.downstream_of(6).unwrap().is_empty());
        assert_eq!(router.expected_ids()[&5], BTreeSet::from([2]));
        assert_eq!(router.expected_ids()[&0], BTreeSet::from([0]));
    }

    #[test]
    fn arbol_es_determinista_con_ids_desordenados() {
        let a = Topology::new([7], [42, 3, 19, 8], 2).unwrap();
        let b = Topology::new([7], [8, 19, 3, 42], 2).unwrap();
        let ra = Router::tree(&a).unwrap();
        let rb = Router::tree(&b).unwrap();
        assert_eq!(ra.downstream_of(7).unwrap(), &BTreeSet::from([3, 8]));
        for id in [7, 3, 8, 19, 42] {
            assert_eq!(ra.downstream_of(id).unwrap(), rb.downstream_of(id).unwrap());
        }
    }

    #[test]
    fn origen_desconocido() {
        let topology = Topology::new([0], [1, 2], 2).unwrap();
        let router = Router::tree(&topology).unwrap();
        assert_eq!(router.downstream_of(99), Err(CommsError::UnknownSource(99)));
    }

    #[test]
    fn arbol_invertido_sube_hacia_el_destino() {
        // raíz 10, orígenes 0..6 con k=2: 10 -> {0,1}, 0 -> {2,3}, 1 -> {4,5}
        let topology = Topology::new(0..6, [10], 2).unwrap();
        let router = Router::inverted_tree(&topology).unwrap();

        assert_eq!(router.downstream_of(0).unwrap(), &BTreeSet::from([10]));
        assert_eq!(router.downstream_of(3).unwrap(), &BTreeSet::from([0]));
        assert_eq!(router.downstream_of(5).unwrap(), &BTreeSet::from([1]));
        assert!(router.downstream_of(10).is_err());

        let expected = router.expected_ids();
        assert_eq!(expected[&10], BTreeSet::from([0, 1]));
        assert_eq!(expected[&0], BTreeSet::from([0, 2, 3]));
        assert_eq!(expected[&1], BTreeSet::from([1, 4, 5]));
        assert!(!expected.contains_key(&2));
    }

    #[test]
    fn reduce_in_place_espera_a_la_raiz_tambien() {
        let topology = Topology::new([0, 1, 2], [0], 2).unwrap();
        let router = Router::inverted_tree(&topology).unwrap();
        assert!(router.downstream_of(0).unwrap().is_empty());
        assert_eq!(router.expected_ids()[&0], BTreeSet::from([0, 1, 2]));
    }

    #[test]
    fn reduce_con_dos_destinos_es_error_de_configuracion() {
        let topology = Topology::new([0, 1], [5, 6], 2).unwrap();
        assert!(matches!(
            Router::inverted_tree(&topology),
            Err(CommsError::InvalidConfig(_))
        ));
    }

    #[test]
    fn flat_cubre_todos_los_destinos() {
        let topology = Topology::new([0, 1, 2], [3, 4], 1).unwrap();
        let router = Router::flat(&topology);
        for s in [0, 1, 2] {
            assert_eq!(router.downstream_of(s).unwrap(), &BTreeSet::from([3, 4]));
        }
        assert_eq!(router.expected_ids()[&3], BTreeSet::from([0, 1, 2]));
    }

    #[test]
    fn topologia_vacia_es_invalida() {
        assert!(Topology::new([], [1], 2).is_err());
        assert!(Topology::new([1], [], 2).is_err());
        assert!(Topology::new([1], [2], 0).is_err());
    }
}
