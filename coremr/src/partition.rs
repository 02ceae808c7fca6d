use crate::helpe::*;

/// Anything the engine can hand out to mappers, one disjoint piece each.
pub trait Splittable {
    /// What a single mapper receives. It travels to the mapper's thread.
    type Part<'a>: Send where Self: 'a;

    /// Size of the input in the unit that [`Partition`]s are expressed in.
    fn units(&self) -> usize;

    /// Cuts `self` along a plan that [`check_plan`] has already accepted.
    fn split<'a>(&'a mut self, plan: &[Partition]) -> Vec<Self::Part<'a>>;
}

impl Partition {
    #[inline(always)]
    pub fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }

    #[inline(always)]
    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn range(&self) -> Range<usize> {
        self.offset..self.end()
    }

    /// Splits `items` equally sized items over `parts` partitions: every
    /// partition but the last gets `items / parts` of them, the last one
    /// also takes the remainder. Offsets and lengths are in units of
    /// `item_size`, so partitions never cut an item in half.
    pub fn split_even(items: usize, item_size: usize, parts: usize) -> Vec<Partition> {
        if parts == 0 {
            return vec![];
        }
        let base = items / parts;
        let mut res = Vec::with_capacity(parts);
        let mut offset = 0;
        for idx in 0..parts {
            let count = if idx + 1 == parts { items - base * idx } else { base };
            let len = count * item_size;
            res.push(Partition::new(offset, len));
            offset += len;
        }

        res
    }
}

/// Accepts `plan` iff it consists of exactly `parts` ranges that tile
/// `[0, units)` in order.
pub fn check_plan(plan: &[Partition], units: usize, parts: usize) -> Result<(), MrError> {
    if plan.len() != parts {
        return Err(MrError::Partition(format!("{} ranges for {} mappers", plan.len(), parts)));
    }
    if let Some(first) = plan.first() {
        if first.offset != 0 {
            return Err(MrError::Partition(format!("first range starts at {}", first.offset)));
        }
    }
    if let Some((idx, (a, b))) = plan.iter()
        .tuple_windows()
        .enumerate()
        .find(|(_, (a, b))| a.end() != b.offset) {
        return Err(MrError::Partition(format!(
            "range {} ends at {} but range {} starts at {}",
            idx, a.end(), idx + 1, b.offset
        )));
    }
    let covered = plan.last().map_or(0, Partition::end);
    if covered != units {
        return Err(MrError::Partition(format!("ranges cover {covered} of {units} units")));
    }

    Ok(())
}

/// Hands out consecutive, disjoint sub-slices of `slice` along `plan`.
pub fn split_slice_mut<'a, T>(slice: &'a mut [T], plan: &[Partition]) -> Vec<&'a mut [T]> {
    let mut rest = slice;
    let mut res = Vec::with_capacity(plan.len());
    for p in plan {
        let (head, tail) = std::mem::take(&mut rest).split_at_mut(p.len);
        res.push(head);
        rest = tail;
    }

    res
}
