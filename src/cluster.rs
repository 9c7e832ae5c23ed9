//! Threshold-based agglomerative clustering on cosine distance
//!
//! Average linkage with no fixed cluster count: two clusters merge only
//! while their linkage distance is strictly below the threshold. Uses the
//! nearest-neighbour-chain algorithm over a condensed distance matrix, so a
//! run is O(n²) time and memory.
//!
//! Average linkage is reducible, so when a mutual nearest pair is already
//! at or above the threshold, neither side can ever merge again and both are
//! finalized. Ties break toward the lower index, making membership a pure
//! function of the input order.

/// Dot product of two equal-length vectors
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Euclidean norm
pub fn norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}

/// Scale to unit length in place. Zero vectors are left untouched.
pub fn normalize(v: &mut [f32]) {
    let n = norm(v);
    if n > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= n;
        }
    }
}

/// Cosine similarity; 0.0 when either vector is zero
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let denom = norm(a) * norm(b);
    if denom <= f32::EPSILON {
        return 0.0;
    }
    dot(a, b) / denom
}

/// Cosine distance on the 0–2 scale
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    (1.0 - cosine_similarity(a, b)).clamp(0.0, 2.0)
}

/// Element-wise mean of vectors; empty input yields an empty vector
pub fn mean_vector<V: AsRef<[f32]>>(vectors: &[V]) -> Vec<f32> {
    let Some(first) = vectors.first() else {
        return Vec::new();
    };
    let mut mean = vec![0.0f32; first.as_ref().len()];
    for v in vectors {
        for (m, x) in mean.iter_mut().zip(v.as_ref()) {
            *m += x;
        }
    }
    let count = vectors.len() as f32;
    for m in mean.iter_mut() {
        *m /= count;
    }
    mean
}

/// Cluster vectors by average-linkage cosine distance.
///
/// Two clusters merge while their average distance is below
/// `1 - similarity_threshold`. Returns every cluster (singletons included)
/// as ascending member indexes, ordered by smallest member.
pub fn agglomerative<V: AsRef<[f32]>>(vectors: &[V], similarity_threshold: f32) -> Vec<Vec<usize>> {
    let n = vectors.len();
    if n == 0 {
        return Vec::new();
    }
    if n == 1 {
        return vec![vec![0]];
    }

    let distance_threshold = 1.0 - similarity_threshold;
    let mut matrix = CondensedMatrix::new(vectors);
    let mut members: Vec<Vec<usize>> = (0..n).map(|i| vec![i]).collect();
    let mut active = vec![true; n];
    let mut remaining = n;
    let mut finished: Vec<Vec<usize>> = Vec::new();
    let mut chain: Vec<usize> = Vec::with_capacity(n);

    while remaining > 1 {
        if chain.is_empty() {
            // remaining > 1 guarantees an active slot
            let start = (0..n).find(|&i| active[i]).unwrap_or(0);
            chain.push(start);
        }

        let a = chain[chain.len() - 1];
        let prev = if chain.len() >= 2 { Some(chain[chain.len() - 2]) } else { None };

        let mut best: Option<(usize, f32)> = None;
        for k in 0..n {
            if k == a || !active[k] {
                continue;
            }
            let d = matrix.get(a, k);
            match best {
                Some((_, bd)) if d >= bd => {}
                _ => best = Some((k, d)),
            }
        }
        let Some((mut b, mut d)) = best else {
            break;
        };
        if let Some(p) = prev {
            let dp = matrix.get(a, p);
            if dp <= d {
                b = p;
                d = dp;
            }
        }

        if Some(b) != prev {
            chain.push(b);
            continue;
        }

        chain.pop();
        chain.pop();

        if d >= distance_threshold {
            for slot in [a, b] {
                active[slot] = false;
                finished.push(std::mem::take(&mut members[slot]));
            }
            remaining -= 2;
            continue;
        }

        let (keep, gone) = if a < b { (a, b) } else { (b, a) };
        let size_keep = members[keep].len() as f32;
        let size_gone = members[gone].len() as f32;
        for k in 0..n {
            if !active[k] || k == keep || k == gone {
                continue;
            }
            let merged = (size_keep * matrix.get(keep, k) + size_gone * matrix.get(gone, k))
                / (size_keep + size_gone);
            matrix.set(keep, k, merged);
        }
        let absorbed = std::mem::take(&mut members[gone]);
        members[keep].extend(absorbed);
        active[gone] = false;
        remaining -= 1;
    }

    for slot in 0..n {
        if active[slot] {
            finished.push(std::mem::take(&mut members[slot]));
        }
    }

    for cluster in finished.iter_mut() {
        cluster.sort_unstable();
    }
    finished.retain(|c| !c.is_empty());
    finished.sort_by_key(|c| c[0]);
    finished
}

/// Upper-triangle distance storage
struct CondensedMatrix {
    n: usize,
    data: Vec<f32>,
}

impl CondensedMatrix {
    fn new<V: AsRef<[f32]>>(vectors: &[V]) -> Self {
        let n = vectors.len();
        let unit: Vec<Vec<f32>> = vectors
            .iter()
            .map(|v| {
                let mut u = v.as_ref().to_vec();
                normalize(&mut u);
                u
            })
            .collect();

        let mut data = Vec::with_capacity(n * (n - 1) / 2);
        for i in 0..n {
            for j in (i + 1)..n {
                data.push((1.0 - dot(&unit[i], &unit[j])).clamp(0.0, 2.0));
            }
        }
        Self { n, data }
    }

    fn offset(&self, i: usize, j: usize) -> usize {
        let (i, j) = if i < j { (i, j) } else { (j, i) };
        self.n * i - i * (i + 1) / 2 + (j - i - 1)
    }

    fn get(&self, i: usize, j: usize) -> f32 {
        self.data[self.offset(i, j)]
    }

    fn set(&mut self, i: usize, j: usize, value: f32) {
        let pos = self.offset(i, j);
        self.data[pos] = value;
    }
}
