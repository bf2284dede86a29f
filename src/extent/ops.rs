//! Set operations over lists of extents: subtraction, merging and the
//! largest-first disjoint split used by the decomposer.

use super::PixelExtent;

/// `a \ b` as at most four rectangles. Splits along x first (full-height
/// left/right slabs), then the remaining middle column along y.
pub fn subtract(a: &PixelExtent, b: &PixelExtent) -> Vec<PixelExtent> {
    if a.is_empty() {
        return Vec::new();
    }
    let i = *a & *b;
    if i.is_empty() {
        return vec![*a];
    }
    let mut out = Vec::with_capacity(4);
    if i.xmin() > a.xmin() {
        out.push(PixelExtent::new(a.xmin(), i.xmin() - 1, a.ymin(), a.ymax()));
    }
    if i.xmax() < a.xmax() {
        out.push(PixelExtent::new(i.xmax() + 1, a.xmax(), a.ymin(), a.ymax()));
    }
    if i.ymin() > a.ymin() {
        out.push(PixelExtent::new(i.xmin(), i.xmax(), a.ymin(), i.ymin() - 1));
    }
    if i.ymax() < a.ymax() {
        out.push(PixelExtent::new(i.xmin(), i.xmax(), i.ymax() + 1, a.ymax()));
    }
    out
}

/// Subtract every extent in `cut` from every extent in `from`.
pub fn subtract_all(from: &[PixelExtent], cut: &[PixelExtent]) -> Vec<PixelExtent> {
    let mut pieces: Vec<PixelExtent> = from.iter().copied().filter(|e| !e.is_empty()).collect();
    for c in cut {
        if pieces.is_empty() {
            break;
        }
        pieces = pieces.iter().flat_map(|p| subtract(p, c)).collect();
    }
    pieces
}

#[inline]
fn union_is_rectangle(a: &PixelExtent, b: &PixelExtent) -> bool {
    let u = *a | *b;
    u.size() == a.size() + b.size() - (*a & *b).size()
}

/// Coalesce pairs whose union is exactly a rectangle. Greedy and not
/// minimal, but the covered area is unchanged.
pub fn merge(list: &[PixelExtent]) -> Vec<PixelExtent> {
    let mut out: Vec<PixelExtent> = list.iter().copied().filter(|e| !e.is_empty()).collect();
    'outer: loop {
        for i in 0..out.len() {
            for j in (i + 1)..out.len() {
                if union_is_rectangle(&out[i], &out[j]) {
                    out[i] = out[i] | out[j];
                    out.remove(j);
                    continue 'outer;
                }
            }
        }
        return out;
    }
}

/// Largest-first disjoint split of tagged extents. The largest remaining
/// extent is kept whole and subtracted from all others, repeatedly. Ties keep
/// input order, so every caller that feeds the same list gets the same result.
pub fn make_disjoint_tagged<T: Copy>(items: Vec<(T, PixelExtent)>) -> Vec<(T, PixelExtent)> {
    let mut work: Vec<(T, PixelExtent)> = items.into_iter().filter(|(_, e)| !e.is_empty()).collect();
    let mut out = Vec::with_capacity(work.len());
    while !work.is_empty() {
        work.sort_by(|a, b| b.1.size().cmp(&a.1.size()));
        let (tag, largest) = work.remove(0);
        work = work
            .into_iter()
            .flat_map(|(t, e)| subtract(&e, &largest).into_iter().map(move |p| (t, p)))
            .collect();
        out.push((tag, largest));
    }
    out
}

pub fn make_disjoint(list: &[PixelExtent]) -> Vec<PixelExtent> {
    make_disjoint_tagged(list.iter().map(|e| ((), *e)).collect())
        .into_iter()
        .map(|(_, e)| e)
        .collect()
}

/// Regrid `bounds` into tiles of at most `tile` pixels, row-major.
pub fn split_tiles(bounds: &PixelExtent, tile: [usize; 2]) -> Vec<PixelExtent> {
    if bounds.is_empty() {
        return Vec::new();
    }
    let tx = tile[0].max(1) as i32;
    let ty = tile[1].max(1) as i32;
    let mut out = Vec::new();
    let mut y0 = bounds.ymin();
    while y0 <= bounds.ymax() {
        let y1 = y0.saturating_add(ty - 1).min(bounds.ymax());
        let mut x0 = bounds.xmin();
        while x0 <= bounds.xmax() {
            let x1 = x0.saturating_add(tx - 1).min(bounds.xmax());
            out.push(PixelExtent::new(x0, x1, y0, y1));
            x0 = x1 + 1;
        }
        y0 = y1 + 1;
    }
    out
}

pub fn union_bounds<'a>(list: impl IntoIterator<Item = &'a PixelExtent>) -> PixelExtent {
    list.into_iter().fold(PixelExtent::empty(), |acc, e| acc | *e)
}

#[inline]
pub fn total_size(list: &[PixelExtent]) -> usize {
    list.iter().map(PixelExtent::size).sum()
}
