//! 公共数据类型
//! Shared geometry types for the segmentation and tracking engine

use serde::{Deserialize, Serialize};

// ========== 图像尺寸 ==========

/// 色块流图像宽度 (像素)
pub const BLOB_FRAME_WIDTH: u16 = 316;
/// 色块流图像高度 (像素)
pub const BLOB_FRAME_HEIGHT: u16 = 208;

/// 边沿流宽度 (边沿坐标, 两路交织)
pub const EDGE_FRAME_WIDTH: u16 = BLOB_FRAME_WIDTH + 320;
/// 边沿流高度 (垂直方向半分辨率)
pub const EDGE_FRAME_HEIGHT: u16 = BLOB_FRAME_HEIGHT / 2;

// ========== 几何类型 ==========

/// 网格点 (线检测网格坐标)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: u8,
    pub y: u8,
}

impl Point {
    pub const fn new(x: u8, y: u8) -> Self {
        Self { x, y }
    }

    /// 距离平方
    pub fn dist2(&self, p: &Point) -> u32 {
        let dx = p.x as i32 - self.x as i32;
        let dy = p.y as i32 - self.y as i32;
        (dx * dx + dy * dy) as u32
    }

    /// 两点中点 (向下取整)
    pub fn avg(&self, p: &Point) -> Point {
        Point {
            x: ((self.x as u16 + p.x as u16) >> 1) as u8,
            y: ((self.y as u16 + p.y as u16) >> 1) as u8,
        }
    }
}

/// 矩形 (左上角 + 宽高)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

impl Rect {
    /// 中心点
    pub fn center(&self) -> (i32, i32) {
        (
            self.x as i32 + (self.width >> 1) as i32,
            self.y as i32 + (self.height >> 1) as i32,
        )
    }
}
