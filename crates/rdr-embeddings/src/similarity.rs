//! Cosine similarity between message and topic vectors.

use ndarray::{Array2, ArrayView1};

use rdr_core::{Error, Result};

/// Normalize in place; a zero vector is left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Pairwise cosine similarity: rows of the result index `a`, columns `b`.
pub fn cosine_matrix(a: &[Vec<f32>], b: &[Vec<f32>]) -> Result<Array2<f32>> {
    if a.is_empty() || b.is_empty() {
        return Ok(Array2::zeros((a.len(), b.len())));
    }

    let ma = to_matrix(a)?;
    let mb = to_matrix(b)?;
    if ma.ncols() != mb.ncols() {
        return Err(Error::Embedding(format!(
            "dimensionality mismatch: {} vs {}",
            ma.ncols(),
            mb.ncols()
        )));
    }

    let norms_a: Vec<f32> = ma.rows().into_iter().map(row_norm).collect();
    let norms_b: Vec<f32> = mb.rows().into_iter().map(row_norm).collect();

    let mut sims = ma.dot(&mb.t());
    for ((i, j), v) in sims.indexed_iter_mut() {
        let denom = norms_a[i] * norms_b[j];
        *v = if denom > 0.0 { *v / denom } else { 0.0 };
    }
    Ok(sims)
}

/// Index and value of the row maximum; the first occurrence wins ties.
pub fn argmax_row(row: ArrayView1<'_, f32>) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, &v) in row.iter().enumerate() {
        match best {
            Some((_, max)) if v <= max => {}
            _ => best = Some((idx, v)),
        }
    }
    best
}

fn to_matrix(rows: &[Vec<f32>]) -> Result<Array2<f32>> {
    let dims = rows[0].len();
    let flat: Vec<f32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
    Array2::from_shape_vec((rows.len(), dims), flat)
        .map_err(|e| Error::Embedding(format!("ragged embedding batch: {e}")))
}

fn row_norm(row: ArrayView1<'_, f32>) -> f32 {
    row.iter().map(|x| x * x).sum::<f32>().sqrt()
}
