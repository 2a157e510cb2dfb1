//! 合成场景 - 生成色块流与边沿流事件 (测试与演示)
//! Synthetic scan-event generators standing in for the capture side

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::event::ScanEvent;
use crate::types::{BLOB_FRAME_HEIGHT, EDGE_FRAME_HEIGHT, EDGE_FRAME_WIDTH};

/// 色块流行数 (垂直方向半分辨率)
pub const BLOB_SCAN_ROWS: u16 = BLOB_FRAME_HEIGHT / 2;

// ========== 色块流 ==========

/// 一个实心矩形色块 (列、行坐标, 含边界)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SceneRect {
    pub signature: u8,
    pub left: u16,
    pub right: u16,
    pub top: u16,
    pub bottom: u16,
}

impl SceneRect {
    pub fn new(signature: u8, left: u16, right: u16, top: u16, bottom: u16) -> Self {
        Self {
            signature,
            left,
            right,
            top,
            bottom,
        }
    }

    /// 平移 (负值截到 0)
    pub fn shifted(&self, dx: i32, dy: i32) -> Self {
        let mv = |v: u16, d: i32| (v as i32 + d).max(0) as u16;
        Self {
            left: mv(self.left, dx),
            right: mv(self.right, dx),
            top: mv(self.top, dy),
            bottom: mv(self.bottom, dy),
            ..*self
        }
    }
}

/// 一帧色块流: 每行一个行开始, 行内按列排序的逐像素行程, 最后帧结束
pub fn blob_frame(rects: &[SceneRect]) -> Vec<ScanEvent> {
    let mut events = Vec::new();
    for row in 0..BLOB_SCAN_ROWS {
        events.push(ScanEvent::RowStart);
        let mut runs: Vec<(u16, u8)> = rects
            .iter()
            .filter(|r| row >= r.top && row <= r.bottom)
            .flat_map(|r| (r.left..=r.right).map(move |col| (col, r.signature)))
            .collect();
        runs.sort();
        runs.dedup_by_key(|(col, _)| *col); // 重叠处取较小的签名
        events.extend(
            runs.into_iter()
                .map(|(col, signature)| ScanEvent::Run { signature, col }),
        );
    }
    events.push(ScanEvent::FrameEnd);
    events
}

// ========== 边沿流 ==========

/// 边沿场景中的元素
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EdgeItem {
    /// 竖直暗线: 水平扫描在 `pos` 处下降, `pos + width` 处上升
    VerticalLine { pos: u16, width: u16, top: u16, bottom: u16 },
    /// 水平暗带: 垂直扫描列 `col0..=col1` 在 `top` 行下降, `bottom` 行上升
    HorizontalBand { col0: u16, col1: u16, top: u16, bottom: u16 },
    /// 条码: 每个水平扫描行上相同的一组边沿
    Barcode { left: u16, unit: u16, value: u8, top: u16, bottom: u16 },
}

/// 条码边沿 (位置, 下降沿)
///
/// 起始模块为窄, 之后每一位用一个宽模块或两个窄模块表示, 宽度为 1:3。
/// 末尾补窄模块到最少数量, 再以一个远端边沿收尾。
pub fn barcode_edges(left: u16, unit: u16, value: u8) -> Vec<(u16, bool)> {
    let unit = unit.max(1);
    let mut widths = vec![unit];
    let mut index = 1;
    for bit in (0..4).rev().map(|b| (value >> b) & 1) {
        // 第 i 个模块以下降沿 (i 为奇数) 结束时表示 0
        let natural = (index & 1 == 0) as u8;
        if natural == bit {
            widths.push(unit * 3);
            index += 1;
        } else {
            widths.push(unit);
            widths.push(unit);
            index += 2;
        }
    }
    while widths.len() < 7 {
        widths.push(unit);
    }
    widths.push(unit * 11);

    let mut edges = Vec::with_capacity(widths.len() + 1);
    let mut pos = left;
    edges.push((pos, true));
    for (i, w) in widths.iter().enumerate() {
        pos += w;
        edges.push((pos, i & 1 == 1));
    }
    edges
}

/// 可复现的边沿场景, 可选逐帧水平抖动
pub struct EdgeScene {
    items: Vec<EdgeItem>,
    jitter: u16,
    rng: StdRng,
}

impl EdgeScene {
    pub fn new(items: Vec<EdgeItem>) -> Self {
        Self {
            items,
            jitter: 0,
            rng: StdRng::seed_from_u64(0),
        }
    }

    /// 每帧竖直线整体水平偏移 `[-jitter, jitter]`
    pub fn with_jitter(mut self, jitter: u16, seed: u64) -> Self {
        self.jitter = jitter;
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn items(&self) -> &[EdgeItem] {
        &self.items
    }

    /// 生成下一帧
    pub fn next_frame(&mut self) -> Vec<ScanEvent> {
        let dx = if self.jitter > 0 {
            let j = self.jitter as i32;
            self.rng.gen_range(-j..=j)
        } else {
            0
        };
        edge_frame(&self.items, dx)
    }
}

fn offset(pos: u16, dx: i32) -> u16 {
    (pos as i32 + dx).clamp(0, EDGE_FRAME_WIDTH as i32 - 1) as u16
}

/// 一帧边沿流: 每行先水平扫描再垂直扫描, 最后帧结束
pub fn edge_frame(items: &[EdgeItem], dx: i32) -> Vec<ScanEvent> {
    let mut events = Vec::new();
    for row in 0..EDGE_FRAME_HEIGHT {
        events.push(ScanEvent::RowStart);
        let mut h: Vec<(u16, bool)> = Vec::new();
        let mut v: Vec<(u16, bool)> = Vec::new();
        for item in items {
            match *item {
                EdgeItem::VerticalLine {
                    pos,
                    width,
                    top,
                    bottom,
                } if (top..=bottom).contains(&row) => {
                    h.push((offset(pos, dx), true));
                    h.push((offset(pos + width, dx), false));
                }
                EdgeItem::HorizontalBand {
                    col0,
                    col1,
                    top,
                    bottom,
                } if row == top || row == bottom => {
                    let negative = row == top;
                    v.extend((col0..=col1).map(|col| (col << 2, negative)));
                }
                EdgeItem::Barcode {
                    left,
                    unit,
                    value,
                    top,
                    bottom,
                } if (top..=bottom).contains(&row) => {
                    h.extend(barcode_edges(left, unit, value));
                }
                _ => {}
            }
        }
        h.sort_by_key(|e| e.0);
        v.sort_by_key(|e| e.0);
        events.extend(h.into_iter().map(|(pos, neg)| ScanEvent::edge(pos, neg)));
        events.push(ScanEvent::VScanStart);
        events.extend(v.into_iter().map(|(pos, neg)| ScanEvent::edge(pos, neg)));
    }
    events.push(ScanEvent::FrameEnd);
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line::barcode::{decode, detect_code};

    #[test]
    fn test_blob_frame_layout() {
        let events = blob_frame(&[SceneRect::new(2, 5, 7, 1, 1)]);
        assert_eq!(events.len(), BLOB_SCAN_ROWS as usize + 3 + 1);
        assert_eq!(events[0], ScanEvent::RowStart);
        assert_eq!(events[1], ScanEvent::RowStart);
        assert_eq!(events[2], ScanEvent::Run { signature: 2, col: 5 });
        assert_eq!(events[4], ScanEvent::Run { signature: 2, col: 7 });
        assert_eq!(events.last(), Some(&ScanEvent::FrameEnd));
    }

    #[test]
    fn test_shifted_clamps() {
        let r = SceneRect::new(1, 2, 10, 3, 8).shifted(-5, 2);
        assert_eq!((r.left, r.right, r.top, r.bottom), (0, 5, 5, 10));
    }

    #[test]
    fn test_barcode_edges_match_known_layout() {
        let edges = barcode_edges(100, 4, 10);
        assert_eq!(
            edges,
            vec![
                (100, true),
                (104, false),
                (108, true),
                (112, false),
                (124, true),
                (136, false),
                (148, true),
                (152, false),
                (196, true),
            ]
        );
    }

    #[test]
    fn test_barcode_edges_decode_all_values() {
        for value in 0..16u8 {
            let words: Vec<u16> = barcode_edges(40, 4, value)
                .into_iter()
                .map(|(pos, neg)| match ScanEvent::edge(pos, neg) {
                    ScanEvent::Edge(w) => w,
                    _ => unreachable!(),
                })
                .collect();
            let candidate = detect_code(&words, None, 0).unwrap();
            assert_eq!(decode(&candidate.modules), Ok(value), "码值 {}", value);
        }
    }

    #[test]
    fn test_edge_frame_rows() {
        let items = vec![
            EdgeItem::VerticalLine {
                pos: 306,
                width: 12,
                top: 8,
                bottom: 95,
            },
            EdgeItem::HorizontalBand {
                col0: 10,
                col1: 11,
                top: 20,
                bottom: 24,
            },
        ];
        let events = edge_frame(&items, 0);
        let rows = events.iter().filter(|e| **e == ScanEvent::RowStart).count();
        assert_eq!(rows, EDGE_FRAME_HEIGHT as usize);
        let edges = events.iter().filter(|e| matches!(e, ScanEvent::Edge(_))).count();
        assert_eq!(edges, 88 * 2 + 4);
    }

    #[test]
    fn test_jitter_is_reproducible() {
        let items = vec![EdgeItem::VerticalLine {
            pos: 200,
            width: 10,
            top: 0,
            bottom: 50,
        }];
        let mut a = EdgeScene::new(items.clone()).with_jitter(3, 7);
        let mut b = EdgeScene::new(items).with_jitter(3, 7);
        for _ in 0..5 {
            assert_eq!(a.next_frame(), b.next_frame());
        }
    }
}
