/// Monotonic alignment search between tokens (rows) and frames (columns).
///
/// Returns the highest-scoring path as `(token, frame)` cells, ordered by
/// both axes. With `tokens <= frames` every frame belongs to exactly one
/// token and every token owns at least one frame; otherwise the roles are
/// swapped. Either way token indices never decrease as frames advance.
pub fn monotonic_alignment_path(scores: &[Vec<f32>]) -> Vec<(usize, usize)> {
    let rows = scores.len();
    let cols = scores.first().map_or(0, Vec::len);
    if rows == 0 || cols == 0 {
        return Vec::new();
    }

    if rows > cols {
        let transposed = (0..cols)
            .map(|c| scores.iter().map(|row| row[c]).collect::<Vec<_>>())
            .collect::<Vec<_>>();
        return search(&transposed)
            .into_iter()
            .map(|(frame, token)| (token, frame))
            .collect();
    }

    search(scores)
}

/// Rows advance by at most one per column; requires `rows <= cols`.
fn search(values: &[Vec<f32>]) -> Vec<(usize, usize)> {
    let rows = values.len();
    let cols = values[0].len();
    debug_assert!(rows <= cols);

    let mut prev = vec![f32::NEG_INFINITY; rows];
    let mut curr = vec![f32::NEG_INFINITY; rows];
    let mut bp = vec![0u8; rows * cols];
    prev[0] = values[0][0];

    for c in 1..cols {
        let remaining = cols - 1 - c;
        let lo = (rows - 1).saturating_sub(remaining);
        let hi = c.min(rows - 1);

        curr.fill(f32::NEG_INFINITY);
        let bp_offset = c * rows;
        for r in lo..=hi {
            let stay = prev[r];
            let advance = if r > 0 { prev[r - 1] } else { f32::NEG_INFINITY };
            let (best, step) = if advance > stay {
                (advance, 1)
            } else {
                (stay, 0)
            };
            curr[r] = best + values[r][c];
            bp[bp_offset + r] = step;
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    let mut r = rows - 1;
    let mut path = Vec::with_capacity(cols);
    path.push((r, cols - 1));
    for c in (1..cols).rev() {
        if bp[c * rows + r] == 1 {
            debug_assert!(r >= 1);
            r -= 1;
        }
        path.push((r, c - 1));
    }
    path.reverse();
    debug_assert_eq!(path[0], (0, 0));
    path
}

/// Row-major `(rows, cols)` 0/1 mask with the path cells set.
pub fn path_to_mask(path: &[(usize, usize)], rows: usize, cols: usize) -> Vec<f32> {
    let mut mask = vec![0f32; rows * cols];
    for &(r, c) in path {
        mask[r * cols + c] = 1.0;
    }
    mask
}
