//! 色码聚类
//! Color code clustering: clump tagging, clump merge and code synthesis

use super::compose::distance;
use super::types::{
    BlobCandidate, ColorCodeMode, SignatureTable, CL_NUM_SIGNATURES, MAX_COLOR_CODE_MODELS,
};

/// 面积一致性容差 (%)
const AREA_TOLERANCE: u32 = 800;
const MAX_CLUMP_BLOBS: usize = MAX_COLOR_CODE_MODELS * 2;
const SIG_MASK: u16 = 0x07;

/// 色码聚类参数
#[derive(Clone, Copy, Debug)]
pub struct ColorCodeParams<'a> {
    pub mode: ColorCodeMode,
    pub signatures: &'a SignatureTable,
    pub max_coded_dist: u16,
}

impl ColorCodeParams<'_> {
    fn cc_signature(&self, model: u16) -> bool {
        self.signatures
            .cc_signature(self.mode, (model & SIG_MASK) as u8)
    }

    /// 两个色块是否足够靠近, 可以组成色码
    fn closeby(&self, b0: &BlobCandidate, b1: &BlobCandidate) -> bool {
        if !b0.is_valid() || !b1.is_valid() || b0.model == b1.model {
            return false;
        }
        if !self.cc_signature(b0.model) || !self.cc_signature(b1.model) {
            return false;
        }
        distance(b0, b1) <= self.max_coded_dist as i32
    }
}

#[inline]
fn tag(model: u16) -> u16 {
    model & !SIG_MASK
}

#[inline]
fn is_plain(model: u16) -> bool {
    model <= CL_NUM_SIGNATURES as u16
}

/// 两个色块中心之间的角度 (度)
pub fn angle(b0: &BlobCandidate, b1: &BlobCandidate) -> i16 {
    let (acx, acy) = center(b0);
    let (bcx, bcy) = center(b1);
    let res = ((acy - bcy) as f32).atan2((bcx - acx) as f32) * 180.0 / 3.1415;
    res as i16
}

fn center(b: &BlobCandidate) -> (i32, i32) {
    (
        (b.right as i32 + b.left as i32) / 2,
        (b.bottom as i32 + b.top as i32) / 2,
    )
}

/// 沿轴的中心距离
fn axis_distance(b0: &BlobCandidate, b1: &BlobCandidate, horizontal: bool) -> i32 {
    let (c0, c1) = (center(b0), center(b1));
    if horizontal {
        (c0.0 - c1.0).abs()
    } else {
        (c0.1 - c1.1).abs()
    }
}

/// 面积一致性筛选: 保留与"面积相近者最多"的那个色块面积相容的成员
fn cleanup_by_area(blobs: &[BlobCandidate], members: &mut Vec<usize>) {
    let range = |area: u32| (area * 100 / (100 + AREA_TOLERANCE), area + area * AREA_TOLERANCE / 100);

    let mut max_equal = 0;
    let mut max_equal_area = None;
    for &i in members.iter() {
        let (lower, upper) = range(blobs[i].area());
        let equal = members
            .iter()
            .filter(|&&j| j != i)
            .filter(|&&j| (lower..=upper).contains(&blobs[j].area()))
            .count();
        if equal > max_equal {
            max_equal = equal;
            max_equal_area = Some(blobs[i].area());
        }
    }

    let Some(max_equal_area) = max_equal_area else {
        members.clear();
        return;
    };
    members.retain(|&i| {
        let (lower, upper) = range(blobs[i].area());
        (lower..=upper).contains(&max_equal_area)
    });
}

/// 去掉相邻的重复签名 (仅在发现重复时生效)
fn cleanup_adjacent(blobs: &[BlobCandidate], members: &mut Vec<usize>) {
    let mut dedup: Vec<usize> = Vec::with_capacity(members.len());
    let mut found = false;
    for &m in members.iter() {
        match dedup.last() {
            Some(&last) if blobs[last].model & SIG_MASK == blobs[m].model & SIG_MASK => {
                found = true;
            }
            _ => dedup.push(m),
        }
    }
    if found {
        *members = dedup;
    }
}

/// 按到首个色块的轴向距离稳定排序
fn sort_by_axis(blobs: &[BlobCandidate], members: &mut [usize], first: usize, horizontal: bool) {
    let mut keyed: Vec<(i32, usize)> = members
        .iter()
        .map(|&m| (axis_distance(&blobs[first], &blobs[m], horizontal), m))
        .collect();
    // 冒泡排序保持相等距离的原始顺序
    keyed.sort_by_key(|&(d, _)| d);
    for (slot, (_, m)) in members.iter_mut().zip(keyed) {
        *slot = m;
    }
}

/// 对一个团块生成色码, 成员被置为无效
fn synthesize(blobs: &mut [BlobCandidate], members: &mut Vec<usize>) -> Option<BlobCandidate> {
    cleanup_by_area(blobs, members);
    if members.len() < 2 {
        return None;
    }

    let (mut left, mut right, mut top, mut bottom) = (members[0], members[0], members[0], members[0]);
    let (mut avg_w, mut avg_h) = (0i32, 0i32);
    for &m in members.iter() {
        let b = &blobs[m];
        if blobs[left].left > b.left {
            left = m;
        }
        if blobs[top].top > b.top {
            top = m;
        }
        if blobs[right].right < b.right {
            right = m;
        }
        if blobs[bottom].bottom < b.bottom {
            bottom = m;
        }
        avg_w += b.right as i32 - b.left as i32;
        avg_h += b.bottom as i32 - b.top as i32;
    }
    let n = members.len() as i32;
    let avg_w = (avg_w / n).max(1);
    let avg_h = (avg_h / n).max(1);

    let mut coded = BlobCandidate::new(
        0,
        blobs[left].left,
        blobs[right].right,
        blobs[top].top,
        blobs[bottom].bottom,
    );

    let width = (blobs[right].right as i32 - blobs[left].left as i32) * 100 / avg_w;
    let height = (blobs[bottom].bottom as i32 - blobs[top].top as i32) * 100 / avg_h;
    if width > height {
        sort_by_axis(blobs, members, left, true);
    } else {
        sort_by_axis(blobs, members, top, false);
    }

    cleanup_adjacent(blobs, members);
    if members.len() < 2 {
        return None;
    }
    members.truncate(MAX_COLOR_CODE_MODELS);
    let j = members.len();

    let forward = members
        .iter()
        .fold(0u16, |code, &m| (code << 3) | (blobs[m].model & SIG_MASK));
    let reverse = members
        .iter()
        .rev()
        .fold(0u16, |code, &m| (code << 3) | (blobs[m].model & SIG_MASK));

    let first = blobs[members[0]];
    let last = blobs[members[j - 1]];
    if forward < reverse {
        coded.model = forward;
        coded.angle = angle(&first, &last);
    } else {
        coded.model = reverse;
        coded.angle = angle(&last, &first);
    }
    for &m in members.iter() {
        blobs[m].invalidate();
    }
    Some(coded)
}

/// 色码处理主流程
///
/// `blobs` 为普通色块 (会被打标签/失效), 返回生成的色码色块 (最多 `capacity` 个)。
pub fn process_cc(
    blobs: &mut [BlobCandidate],
    params: &ColorCodeParams<'_>,
    capacity: usize,
) -> Vec<BlobCandidate> {
    let n = blobs.len();
    let mut count: u16 = 0;

    // 第一遍: 标记相邻色块
    for i in 0..n {
        for j in (i + 1)..n {
            if !params.closeby(&blobs[i], &blobs[j]) {
                continue;
            }
            let (m0, m1) = (blobs[i].model, blobs[j].model);
            if is_plain(m0) && is_plain(m1) {
                count += 1;
                let scount = count << 3;
                blobs[i].model |= scount;
                blobs[j].model |= scount;
            } else if !is_plain(m0) && is_plain(m1) {
                blobs[j].model |= tag(m0);
            } else if !is_plain(m1) && is_plain(m0) {
                blobs[i].model |= tag(m1);
            }
        }
    }

    // 第二遍: 合并相连的团块
    for i in 0..n {
        if is_plain(blobs[i].model) {
            continue;
        }
        let scount = tag(blobs[i].model);
        for j in (i + 1)..n {
            if is_plain(blobs[j].model) {
                continue;
            }
            let scount1 = tag(blobs[j].model);
            if scount != scount1 && params.closeby(&blobs[i], &blobs[j]) {
                for b in blobs.iter_mut() {
                    if tag(b.model) == scount1 {
                        b.model = (b.model & SIG_MASK) | scount;
                    }
                }
            }
        }
    }

    // 第三遍: 逐个团块生成色码
    let mut coded = Vec::new();
    for i in 1..=count {
        if coded.len() >= capacity {
            break;
        }
        let scount = i << 3;
        let mut members: Vec<usize> = (0..n)
            .filter(|&k| tag(blobs[k].model) == scount)
            .take(MAX_CLUMP_BLOBS)
            .collect();
        if let Some(blob) = synthesize(blobs, &mut members) {
            coded.push(blob);
        }
    }

    // 剩余的团块成员/色码签名失效
    for b in blobs.iter_mut() {
        let drop = if params.mode == ColorCodeMode::Mixed {
            b.model > CL_NUM_SIGNATURES as u16
        } else {
            b.model > CL_NUM_SIGNATURES as u16 || (b.model != 0 && params.cc_signature(b.model))
        };
        if drop {
            b.invalidate();
        }
    }
    coded
}
