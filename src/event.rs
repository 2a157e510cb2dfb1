//! 扫描事件
//! Scan events produced by the pixel classifier, with raw-word codecs for both streams

// ========== 色块流 ==========

/// 色块流: 行开始
pub const BLOB_ROW_START: u16 = 0x0000;
/// 色块流: 队列溢出
pub const BLOB_OVERRUN: u16 = 0xfffe;
/// 色块流: 帧结束
pub const BLOB_FRAME_END: u16 = 0xffff;

// ========== 边沿流 ==========

/// 边沿流: 水平扫描行开始
pub const EDGE_HSCAN_START: u16 = 0xff00;
/// 边沿流: 垂直扫描行开始
pub const EDGE_VSCAN_START: u16 = 0xff01;
/// 边沿流: 错误
pub const EDGE_ERROR: u16 = 0xfffe;
/// 边沿流: 帧结束
pub const EDGE_FRAME_END: u16 = 0xffff;
/// 边沿极性位 (置位为下降沿)
pub const EDGE_NEGATIVE: u16 = 0x8000;

/// 一个扫描事件, 只被消费一次
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanEvent {
    /// 新行开始 (色块流的行 / 边沿流的水平扫描行)
    RowStart,
    /// 垂直扫描行开始
    VScanStart,
    /// 色块行程: 签名 + 起始列
    Run { signature: u8, col: u16 },
    /// 边沿: 原始字 (bit15 为极性)
    Edge(u16),
    FrameEnd,
    /// 队列溢出 / 源端错误, 本帧作废
    Overrun,
}

impl ScanEvent {
    /// 解码色块流的原始字
    pub fn from_blob_word(word: u16) -> Self {
        match word {
            BLOB_ROW_START => ScanEvent::RowStart,
            BLOB_OVERRUN => ScanEvent::Overrun,
            BLOB_FRAME_END => ScanEvent::FrameEnd,
            w => ScanEvent::Run {
                signature: (w & 0x07) as u8,
                col: w >> 3,
            },
        }
    }

    /// 编码为色块流的原始字
    pub fn to_blob_word(&self) -> u16 {
        match *self {
            ScanEvent::RowStart | ScanEvent::VScanStart => BLOB_ROW_START,
            ScanEvent::Run { signature, col } => (col << 3) | (signature as u16 & 0x07),
            ScanEvent::Edge(w) => w,
            ScanEvent::FrameEnd => BLOB_FRAME_END,
            ScanEvent::Overrun => BLOB_OVERRUN,
        }
    }

    /// 解码边沿流的原始字
    pub fn from_edge_word(word: u16) -> Self {
        match word {
            EDGE_HSCAN_START => ScanEvent::RowStart,
            EDGE_VSCAN_START => ScanEvent::VScanStart,
            EDGE_ERROR => ScanEvent::Overrun,
            EDGE_FRAME_END => ScanEvent::FrameEnd,
            w => ScanEvent::Edge(w),
        }
    }

    /// 编码为边沿流的原始字
    pub fn to_edge_word(&self) -> u16 {
        match *self {
            ScanEvent::RowStart => EDGE_HSCAN_START,
            ScanEvent::VScanStart => EDGE_VSCAN_START,
            ScanEvent::Run { col, .. } => col,
            ScanEvent::Edge(w) => w,
            ScanEvent::FrameEnd => EDGE_FRAME_END,
            ScanEvent::Overrun => EDGE_ERROR,
        }
    }

    /// 构造一个边沿事件
    pub fn edge(position: u16, negative: bool) -> Self {
        let w = position & !EDGE_NEGATIVE;
        ScanEvent::Edge(if negative { w | EDGE_NEGATIVE } else { w })
    }
}

/// 边沿位置 (去掉极性位)
#[inline]
pub fn edge_position(word: u16) -> u16 {
    word & !EDGE_NEGATIVE
}

/// 是否为下降沿
#[inline]
pub fn edge_is_negative(word: u16) -> bool {
    word & EDGE_NEGATIVE != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_blob_words() {
        assert_eq!(ScanEvent::from_blob_word(0), ScanEvent::RowStart);
        assert_eq!(ScanEvent::from_blob_word(0xffff), ScanEvent::FrameEnd);
        assert_eq!(ScanEvent::from_blob_word(0xfffe), ScanEvent::Overrun);
        assert_eq!(
            ScanEvent::from_blob_word((42 << 3) | 5),
            ScanEvent::Run {
                signature: 5,
                col: 42
            }
        );
    }

    #[test]
    fn test_decode_edge_words() {
        assert_eq!(ScanEvent::from_edge_word(0xff00), ScanEvent::RowStart);
        assert_eq!(ScanEvent::from_edge_word(0xff01), ScanEvent::VScanStart);
        assert_eq!(ScanEvent::from_edge_word(0xfffe), ScanEvent::Overrun);
        let e = ScanEvent::edge(300, true);
        assert_eq!(e, ScanEvent::Edge(0x8000 | 300));
        if let ScanEvent::Edge(w) = e {
            assert!(edge_is_negative(w));
            assert_eq!(edge_position(w), 300);
        }
    }
}
