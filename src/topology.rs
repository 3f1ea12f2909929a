use crate::circuit::NumericCircuit;
use crate::error::Result;
use crate::sparse::csc_from_triplets;
use sprs::CsMat;

/// Builds the bus-bus connectivity matrix of the in-service network.
///
/// An entry `(i, j)` is nonzero when an active branch joins active buses
/// `i` and `j`. Every bus is connected to itself.
pub fn get_adjacency_matrix(nc: &NumericCircuit) -> CsMat<f64> {
    let nb = nc.nbus();
    let br = &nc.branch;
    let mut entries: Vec<(usize, usize, f64)> = (0..nb).map(|i| (i, i, 1.0)).collect();
    for k in 0..nc.nbr() {
        let (f, t) = (br.f[k], br.t[k]);
        if br.active[k] && nc.bus.active[f] && nc.bus.active[t] {
            entries.push((f, t, 1.0));
            entries.push((t, f, 1.0));
        }
    }
    csc_from_triplets((nb, nb), &entries)
}

/// Finds the connected components of a graph given by its adjacency
/// matrix, using an iterative depth-first search.
///
/// Returns one sorted list of node indices per island. Islands are ordered
/// by their lowest node and together cover every node exactly once.
pub fn find_islands(adj: &CsMat<f64>) -> Vec<Vec<usize>> {
    let n = adj.rows();
    let adj = adj.to_csc();
    let mut visited = vec![false; n];
    let mut islands = Vec::new();
    let mut stack = Vec::new();

    for start in 0..n {
        if visited[start] {
            continue;
        }
        let mut island = Vec::new();
        stack.push(start);
        while let Some(node) = stack.pop() {
            if visited[node] {
                continue;
            }
            visited[node] = true;
            island.push(node);

            if let Some(col) = adj.outer_view(node) {
                for (other, &a) in col.iter() {
                    if a != 0.0 && !visited[other] {
                        stack.push(other);
                    }
                }
            }
        }
        island.sort_unstable();
        islands.push(island);
    }
    islands
}

/// A connected part of the circuit, solved on its own.
#[derive(Debug, Clone)]
pub struct Island {
    /// Position in the island list.
    pub index: usize,
    /// Owned copy of the island's buses and branches.
    pub circuit: NumericCircuit,
    /// Whole-grid index of each island bus.
    pub original_bus_idx: Vec<usize>,
    /// Whole-grid index of each island branch.
    pub original_branch_idx: Vec<usize>,
}

/// Splits the circuit into islands.
///
/// Branches are assigned to the island that contains both of their ends;
/// out-of-service branches joining two islands belong to neither. Islands
/// made only of out-of-service buses are dropped.
pub fn split_into_islands(nc: &NumericCircuit) -> Result<Vec<Island>> {
    nc.validate()?;
    let groups = find_islands(&get_adjacency_matrix(nc));

    let mut bus_island = vec![0; nc.nbus()];
    for (g, buses) in groups.iter().enumerate() {
        for &i in buses {
            bus_island[i] = g;
        }
    }
    let mut branches: Vec<Vec<usize>> = vec![Vec::new(); groups.len()];
    for k in 0..nc.nbr() {
        let (f, t) = (nc.branch.f[k], nc.branch.t[k]);
        if bus_island[f] == bus_island[t] {
            branches[bus_island[f]].push(k);
        }
    }

    let mut islands = Vec::with_capacity(groups.len());
    for (buses, brs) in groups.into_iter().zip(branches) {
        if buses.iter().all(|&i| !nc.bus.active[i]) {
            continue;
        }
        islands.push(Island {
            index: islands.len(),
            circuit: nc.slice(&buses, &brs)?,
            original_bus_idx: buses,
            original_branch_idx: brs,
        });
    }
    log::debug!("{} island(s) found", islands.len());
    Ok(islands)
}
