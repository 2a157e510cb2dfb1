//! 行程合并与连通域组装
//! Run-length merging and per-signature connected-component assembly

use log::warn;

/// 同签名行程之间允许的最大间隙 (列)
pub const RUN_MERGE_GAP: u16 = 5;
/// 每个签名的连通域上限
pub const MAX_ASSEMBLED_BLOBS: usize = 64;

/// 一行内的同签名线段, 列区间为 [start_col, end_col)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RowSegment {
    pub signature: u8,
    pub row: u16,
    pub start_col: u16,
    pub end_col: u16,
}

// ========== 行程合并 ==========

/// 把逐像素的行程事件合并成行线段
#[derive(Debug)]
pub struct RunMerger {
    row: i32, // 当前行, 首个行开始前为 -1
    seg_sig: u8,
    seg_start: u16,
    seg_end: u16,
}

impl Default for RunMerger {
    fn default() -> Self {
        Self::new()
    }
}

impl RunMerger {
    pub fn new() -> Self {
        Self {
            row: -1,
            seg_sig: 0,
            seg_start: 0,
            seg_end: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn row(&self) -> i32 {
        self.row
    }

    fn emit(&self, start_col: u16, len: u16) -> Option<RowSegment> {
        if self.row < 0 || len == 0 {
            return None;
        }
        Some(RowSegment {
            signature: self.seg_sig,
            row: self.row as u16,
            start_col,
            end_col: start_col + len,
        })
    }

    /// 行结束时输出未完成的线段 (向左扩展一列)
    fn flush_row_end(&mut self) -> Option<RowSegment> {
        if self.seg_sig == 0 {
            return None;
        }
        let start = self.seg_start.saturating_sub(1);
        let len = self.seg_end - self.seg_start + 1;
        let seg = self.emit(start, len);
        self.seg_sig = 0;
        seg
    }

    /// 行开始事件
    pub fn row_start(&mut self) -> Option<RowSegment> {
        let seg = self.flush_row_end();
        self.row += 1;
        seg
    }

    /// 帧结束, 输出最后一行的残余线段
    pub fn finish(&mut self) -> Option<RowSegment> {
        self.flush_row_end()
    }

    /// 行程事件, 可能输出一个已完成的线段
    pub fn push(&mut self, signature: u8, col: u16) -> Option<RowSegment> {
        if self.seg_sig == 0 {
            self.start_run(signature, col);
            return None;
        }

        let gap = col.checked_sub(self.seg_end);
        let close = gap.map_or(false, |g| g <= RUN_MERGE_GAP);

        if signature == self.seg_sig {
            if close {
                self.seg_end = col + 1;
                return None;
            }
            let seg = self.emit(self.seg_start, self.seg_end - self.seg_start);
            self.start_run(signature, col);
            return seg;
        }

        if close {
            self.seg_end = col;
        }
        let seg = self.emit(self.seg_start, self.seg_end - self.seg_start);
        self.start_run(signature, col);
        seg
    }

    fn start_run(&mut self, signature: u8, col: u16) {
        self.seg_sig = signature;
        self.seg_start = col;
        self.seg_end = col + 1;
    }
}

// ========== 连通域组装 ==========

/// 组装完成的色块
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AssembledBlob {
    pub left: u16,
    pub right: u16,
    pub top: u16,
    pub bottom: u16,
    pub area: u32,
}

#[derive(Debug)]
struct ActiveBlob {
    blob: AssembledBlob,
    last_row: u16,
    prev_runs: Vec<(u16, u16)>, // 上一行的线段
    cur_runs: Vec<(u16, u16)>,  // 当前行的线段
}

impl ActiveBlob {
    fn overlaps_prev(&self, start: u16, end: u16) -> bool {
        self.prev_runs.iter().any(|&(s, e)| start < e && s < end)
    }

    fn absorb(&mut self, other: ActiveBlob) {
        self.blob.left = self.blob.left.min(other.blob.left);
        self.blob.right = self.blob.right.max(other.blob.right);
        self.blob.top = self.blob.top.min(other.blob.top);
        self.blob.bottom = self.blob.bottom.max(other.blob.bottom);
        self.blob.area += other.blob.area;
        self.last_row = self.last_row.max(other.last_row);
        self.prev_runs.extend(other.prev_runs);
        self.cur_runs.extend(other.cur_runs);
    }
}

/// 单个签名的连通域组装器, 线段需按行递增输入
#[derive(Debug)]
pub struct CcAssembler {
    active: Vec<ActiveBlob>,
    finished: Vec<AssembledBlob>,
    current_row: Option<u16>,
    capacity: usize,
    truncated: u32,
}

impl Default for CcAssembler {
    fn default() -> Self {
        Self::new(MAX_ASSEMBLED_BLOBS)
    }
}

impl CcAssembler {
    pub fn new(capacity: usize) -> Self {
        Self {
            active: Vec::new(),
            finished: Vec::new(),
            current_row: None,
            capacity,
            truncated: 0,
        }
    }

    pub fn reset(&mut self) {
        self.active.clear();
        self.finished.clear();
        self.current_row = None;
    }

    pub fn truncated(&self) -> u32 {
        self.truncated
    }

    fn count(&self) -> usize {
        self.active.len() + self.finished.len()
    }

    fn advance_row(&mut self, row: u16) {
        let mut i = 0;
        while i < self.active.len() {
            if self.active[i].last_row + 1 == row {
                let runs = std::mem::take(&mut self.active[i].cur_runs);
                self.active[i].prev_runs = runs;
                i += 1;
            } else {
                let done = self.active.swap_remove(i);
                self.finished.push(done.blob);
            }
        }
        self.current_row = Some(row);
    }

    /// 加入一条线段, 容量不足时返回 false
    pub fn add(&mut self, segment: &RowSegment) -> bool {
        let row = segment.row;
        if self.current_row != Some(row) {
            self.advance_row(row);
        }
        let (start, end) = (segment.start_col, segment.end_col);

        let touching: Vec<usize> = (0..self.active.len())
            .filter(|&i| self.active[i].overlaps_prev(start, end))
            .collect();

        let target = match touching.first() {
            Some(&first) => {
                // 多个连通域在本行汇合, 从后往前合并到第一个
                for &other in touching.iter().skip(1).rev() {
                    let merged = self.active.swap_remove(other);
                    self.active[first].absorb(merged);
                }
                first
            }
            None => {
                if self.count() >= self.capacity {
                    self.truncated += 1;
                    return false;
                }
                self.active.push(ActiveBlob {
                    blob: AssembledBlob {
                        left: start,
                        right: end - 1,
                        top: row,
                        bottom: row,
                        area: 0,
                    },
                    last_row: row,
                    prev_runs: Vec::new(),
                    cur_runs: Vec::new(),
                });
                self.active.len() - 1
            }
        };

        let blob = &mut self.active[target];
        blob.blob.left = blob.blob.left.min(start);
        blob.blob.right = blob.blob.right.max(end - 1);
        blob.blob.bottom = blob.blob.bottom.max(row);
        blob.blob.area += (end - start) as u32;
        blob.last_row = row;
        blob.cur_runs.push((start, end));
        true
    }

    /// 帧结束: 关闭所有连通域, 按面积降序返回
    pub fn end_frame(&mut self) -> Vec<AssembledBlob> {
        let active = std::mem::take(&mut self.active);
        self.finished.extend(active.into_iter().map(|a| a.blob));
        let mut blobs = std::mem::take(&mut self.finished);
        blobs.sort_by(|a, b| b.area.cmp(&a.area));
        self.current_row = None;
        if self.truncated > 0 {
            warn!("⚠️  连通域容量不足, 累计丢弃 {} 条线段", self.truncated);
        }
        blobs
    }
}
