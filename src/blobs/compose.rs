//! 色块合成: 相邻合并与包含剔除
//! Adjacency merge and containment removal over blob candidates

use super::types::BlobCandidate;

/// 沿一个轴的区间对: [a, b] 为主轴, [c, d] 为副轴
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Extents {
    a: u16,
    b: u16,
    c: u16,
    d: u16,
}

impl Extents {
    /// 主轴为水平方向 (left, right, top, bottom)
    fn horizontal(blob: &BlobCandidate) -> Self {
        Self {
            a: blob.left,
            b: blob.right,
            c: blob.top,
            d: blob.bottom,
        }
    }

    /// 主轴为垂直方向 (top, bottom, left, right)
    fn vertical(blob: &BlobCandidate) -> Self {
        Self {
            a: blob.top,
            b: blob.bottom,
            c: blob.left,
            d: blob.right,
        }
    }

    fn apply_horizontal(&self, blob: &mut BlobCandidate) {
        blob.left = self.a;
        blob.right = self.b;
        blob.top = self.c;
        blob.bottom = self.d;
    }

    fn apply_vertical(&self, blob: &mut BlobCandidate) {
        blob.top = self.a;
        blob.bottom = self.b;
        blob.left = self.c;
        blob.right = self.d;
    }
}

#[inline]
fn within(lo: u16, v: u16, hi: u16) -> bool {
    lo <= v && v <= hi
}

/// 8 种相对位置的非对称合并, 合并成功时返回 true (调用方使第二个色块失效)
fn merge(e0: &mut Extents, e1: &Extents, merge_dist: u16) -> bool {
    // 第一个在后, 第二个在前
    let c0 = within(e0.a, e1.b, e0.b) || (e0.a >= e1.b && e0.a - e1.b <= merge_dist);
    let c1 = e0.a >= e1.a;
    if c0 && c1 {
        let c2 = within(e0.c, e1.c, e0.d);
        let c3 = within(e0.c, e1.d, e0.d);
        if c2 && !c3 {
            e0.a = e1.a;
            e0.d = e1.d;
            return true;
        } else if !c2 && c3 {
            e0.a = e1.a;
            e0.c = e1.c;
            return true;
        } else if c2 && c3 {
            e0.a = e1.a;
            return true;
        } else if within(e1.c, e0.c, e1.d) && within(e1.c, e0.d, e1.d) {
            e0.a = e1.a;
            e0.c = e1.c;
            e0.d = e1.d;
            return true;
        }
        return false;
    }

    // 第一个在前, 第二个在后
    let c0 = within(e1.a, e0.b, e1.b) || (e1.a >= e0.b && e1.a - e0.b <= merge_dist);
    let c1 = e1.a >= e0.a;
    if c0 && c1 {
        let c2 = within(e1.c, e0.c, e1.d);
        let c3 = within(e1.c, e0.d, e1.d);
        if c2 && !c3 {
            e0.b = e1.b;
            e0.c = e1.c;
            return true;
        } else if !c2 && c3 {
            e0.b = e1.b;
            e0.d = e1.d;
            return true;
        } else if c2 && c3 {
            e0.b = e1.b;
            e0.c = e1.c;
            e0.d = e1.d;
            return true;
        } else if within(e0.c, e1.c, e0.d) && within(e0.c, e1.d, e0.d) {
            e0.b = e1.b;
            return true;
        }
    }
    false
}

/// 两两相邻合并一轮, 返回合并次数 (调用方循环直到为 0)
pub fn combine2(blobs: &mut [BlobCandidate], merge_dist: u16) -> usize {
    let mut merged = 0;
    for i in 0..blobs.len() {
        if !blobs[i].is_valid() {
            continue;
        }
        for j in (i + 1)..blobs.len() {
            if !blobs[j].is_valid() {
                continue;
            }
            let other = blobs[j];

            let mut e = Extents::horizontal(&blobs[i]);
            if merge(&mut e, &Extents::horizontal(&other), merge_dist) {
                e.apply_horizontal(&mut blobs[i]);
                blobs[j].invalidate();
                merged += 1;
            }

            let mut e = Extents::vertical(&blobs[i]);
            if merge(&mut e, &Extents::vertical(&other), merge_dist) {
                e.apply_vertical(&mut blobs[i]);
                blobs[j].invalidate();
                merged += 1;
            }
        }
    }
    merged
}

/// 合并直到不再变化
pub fn combine2_fixpoint(blobs: &mut [BlobCandidate], merge_dist: u16) -> usize {
    let mut total = 0;
    loop {
        let n = combine2(blobs, merge_dist);
        if n == 0 {
            return total;
        }
        total += n;
    }
}

/// 剔除被其他色块完全包含的色块, 返回失效数量
pub fn combine(blobs: &mut [BlobCandidate]) -> usize {
    let mut invalid = 0;
    for i in 0..blobs.len() {
        for j in (i + 1)..blobs.len() {
            if !blobs[i].is_valid() || !blobs[j].is_valid() {
                continue;
            }
            if blobs[i].contains(&blobs[j]) {
                blobs[j].invalidate();
                invalid += 1;
            } else if blobs[j].contains(&blobs[i]) {
                blobs[i].invalidate();
                invalid += 1;
            }
        }
    }
    invalid
}

/// 两个色块之间的间距, 不相邻时返回 0x7fff
pub fn distance(b0: &BlobCandidate, b1: &BlobCandidate) -> i32 {
    let (l0, r0, t0, bt0) = (b0.left as i32, b0.right as i32, b0.top as i32, b0.bottom as i32);
    let (l1, r1, t1, bt1) = (b1.left as i32, b1.right as i32, b1.top as i32, b1.bottom as i32);

    let v_overlap = (t0 <= t1 && t1 <= bt0) || (t0 <= bt1 && (bt1 <= bt0 || t1 <= t0));
    let h_overlap = (l0 <= l1 && l1 <= r0) || (l0 <= r1 && (r1 <= r0 || l1 <= l0));

    if l0 >= l1 && v_overlap {
        return l0 - r1;
    }
    if l1 >= l0 && v_overlap {
        return l1 - r0;
    }
    if t0 >= t1 && h_overlap {
        return t0 - bt1;
    }
    if t1 >= t0 && h_overlap {
        return t1 - bt0;
    }
    0x7fff
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    fn blob(l: u16, r: u16, t: u16, b: u16) -> BlobCandidate {
        BlobCandidate::new(1, l, r, t, b)
    }

    fn boxes(blobs: &[BlobCandidate]) -> Vec<(u16, u16, u16, u16)> {
        let mut v: Vec<_> = blobs
            .iter()
            .filter(|b| b.is_valid())
            .map(|b| (b.left, b.right, b.top, b.bottom))
            .collect();
        v.sort();
        v
    }

    #[test]
    fn test_merge_adjacent_pair() {
        let mut blobs = vec![blob(0, 10, 0, 5), blob(12, 22, 0, 5)];
        assert!(combine2(&mut blobs, 2) > 0);
        assert_eq!(boxes(&blobs), vec![(0, 22, 0, 5)]);
        assert!(!blobs[1].is_valid());
    }

    #[test]
    fn test_no_merge_beyond_distance() {
        let mut blobs = vec![blob(0, 10, 0, 5), blob(14, 22, 0, 5)];
        assert_eq!(combine2(&mut blobs, 2), 0);
        assert_eq!(boxes(&blobs).len(), 2);
    }

    #[test]
    fn test_merge_order_independent() {
        let base = vec![
            blob(0, 10, 0, 5),
            blob(12, 22, 0, 5),
            blob(24, 34, 0, 5),
            blob(100, 110, 40, 60),
        ];
        let mut expected = base.clone();
        combine2_fixpoint(&mut expected, 2);
        let expected_boxes = boxes(&expected);
        assert_eq!(expected_boxes, vec![(0, 34, 0, 5), (100, 110, 40, 60)]);

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let mut shuffled = base.clone();
            shuffled.shuffle(&mut rng);
            combine2_fixpoint(&mut shuffled, 2);
            assert_eq!(boxes(&shuffled), expected_boxes);
            assert_eq!(shuffled.iter().filter(|b| !b.is_valid()).count(), 2);
        }
    }

    #[test]
    fn test_containment_idempotent() {
        let mut blobs = vec![
            blob(10, 20, 10, 20),
            blob(0, 30, 0, 30),
            blob(12, 14, 12, 14),
            blob(50, 60, 50, 60),
        ];
        assert_eq!(combine(&mut blobs), 2);
        let once = boxes(&blobs);
        assert_eq!(once, vec![(0, 30, 0, 30), (50, 60, 50, 60)]);
        assert_eq!(combine(&mut blobs), 0);
        assert_eq!(boxes(&blobs), once);
    }

    #[test]
    fn test_distance() {
        let a = blob(0, 10, 0, 10);
        let b = blob(14, 20, 2, 8);
        assert_eq!(distance(&a, &b), 4);
        assert_eq!(distance(&b, &a), 4);
        let c = blob(2, 8, 13, 20);
        assert_eq!(distance(&a, &c), 3);
        let far = blob(100, 110, 100, 110);
        assert_eq!(distance(&a, &far), 0x7fff);
    }
}
