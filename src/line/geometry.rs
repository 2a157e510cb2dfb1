//! 线几何工具
//! Integer tangent comparisons, segment fit error and bearing calculation

use once_cell::sync::Lazy;
use std::f64::consts::PI;

use crate::types::Point;

/// 不可比较时的正切差值
pub const TAN_INFINITE: u32 = 1_000_000;

/// 相邻拟合段之间允许的最大转角 (tan(π/4)×1000)
pub static MAX_SEG_TAN: Lazy<u32> = Lazy::new(|| ((PI / 4.0).tan() * 1000.0) as u32);
/// 视为同向的最大夹角 (tan(π/10)×1000)
pub static MAX_EQUIV_TAN: Lazy<u32> = Lazy::new(|| ((PI / 10.0).tan() * 1000.0) as u32);
/// 跟踪时允许的最大夹角
pub static MAX_TRACKING_TAN: Lazy<u32> = Lazy::new(|| *MAX_EQUIV_TAN);

/// 两条线段夹角正切的绝对值 ×1000
///
/// `min` 为 false 时, 夹角 ≥ 90° 返回 [`TAN_INFINITE`];
/// 为 true 时不关心方向, 只在恰好垂直时返回 [`TAN_INFINITE`]。
pub fn tan_diff_abs1000(p00: &Point, p01: &Point, p10: &Point, p11: &Point, min: bool) -> u32 {
    let xd0 = p01.x as i32 - p00.x as i32;
    let yd0 = p01.y as i32 - p00.y as i32;
    let xd1 = p11.x as i32 - p10.x as i32;
    let yd1 = p11.y as i32 - p10.y as i32;

    let x = xd0 * xd1 + yd0 * yd1;
    let y = yd0 * xd1 - yd1 * xd0;

    if (min && x == 0) || (!min && x <= 0) {
        return TAN_INFINITE;
    }
    (y * 1000 / x).unsigned_abs()
}

/// 线段自身斜率的绝对值 ×1000
pub fn tan_abs1000(p0: &Point, p1: &Point) -> u32 {
    let xd = p1.x as i32 - p0.x as i32;
    let yd = p1.y as i32 - p0.y as i32;
    if xd == 0 {
        return TAN_INFINITE;
    }
    (yd * 1000 / xd).unsigned_abs()
}

/// 是否以水平方向为主
pub fn xdirection(p0: &Point, p1: &Point) -> bool {
    let xd = p1.x as i32 - p0.x as i32;
    let yd = p1.y as i32 - p0.y as i32;
    xd.abs() > yd.abs()
}

/// 点列相对首尾连线的拟合误差, 返回 (平均残差, 最大残差下标)
pub fn line_seg_error(ps: &[Point]) -> (f32, usize) {
    let n = ps.len();
    if n < 2 {
        return (0.0, 0);
    }
    let first = ps[0];
    let last = ps[n - 1];
    let xd = last.x as f32 - first.x as f32;
    let yd = last.y as f32 - first.y as f32;
    let vertical = yd.abs() > xd.abs();

    let mut sum = 0.0f32;
    let mut max_e = -1.0f32;
    let mut max_index = 0;
    for (i, p) in ps.iter().enumerate().skip(1) {
        let e = if vertical {
            p.x as f32 - (first.x as f32 + (p.y as f32 - first.y as f32) * (xd / yd))
        } else if xd != 0.0 {
            p.y as f32 - (first.y as f32 + (p.x as f32 - first.x as f32) * (yd / xd))
        } else {
            // 首尾重合
            p.y as f32 - first.y as f32
        };
        if e.abs() > max_e {
            max_e = e.abs();
            max_index = i;
        }
        sum += e;
    }
    (sum.abs() / (n - 1) as f32, max_index)
}

/// 线段在端点 `p` 处的方位角 (度)
///
/// 0° 指向正上方, 逆时针 (向左) 为正, 取值 (-180, 180]。
pub fn bearing(p0: &Point, p1: &Point, p: &Point) -> i16 {
    let other = if p == p0 { p1 } else { p0 };
    let xdiff = other.x as i32 - p.x as i32;
    let ydiff = p.y as i32 - other.y as i32; // y 轴向下
    (((-xdiff) as f64).atan2(ydiff as f64) * 180.0 / PI) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tan_constants() {
        assert_eq!(*MAX_SEG_TAN, 999);
        assert_eq!(*MAX_EQUIV_TAN, 324);
        assert_eq!(*MAX_TRACKING_TAN, *MAX_EQUIV_TAN);
    }

    #[test]
    fn test_tan_diff_same_direction() {
        let a = Point::new(10, 40);
        let b = Point::new(10, 10);
        assert_eq!(tan_diff_abs1000(&a, &b, &a, &b, false), 0);
        // 反向: min=false 视为不可比较, min=true 为 0
        assert_eq!(tan_diff_abs1000(&a, &b, &b, &a, false), TAN_INFINITE);
        assert_eq!(tan_diff_abs1000(&a, &b, &b, &a, true), 0);
    }

    #[test]
    fn test_tan_diff_45_degrees() {
        let o = Point::new(0, 0);
        let r = Point::new(10, 0);
        let d = Point::new(10, 10);
        assert_eq!(tan_diff_abs1000(&o, &r, &o, &d, false), 1000);
        let u = Point::new(0, 10);
        assert_eq!(tan_diff_abs1000(&o, &r, &o, &u, false), TAN_INFINITE);
        assert_eq!(tan_abs1000(&o, &d), 1000);
        assert_eq!(tan_abs1000(&o, &u), TAN_INFINITE);
    }

    #[test]
    fn test_xdirection() {
        assert!(xdirection(&Point::new(0, 0), &Point::new(10, 3)));
        assert!(!xdirection(&Point::new(0, 0), &Point::new(3, 10)));
        assert!(!xdirection(&Point::new(0, 0), &Point::new(5, 5)));
    }

    #[test]
    fn test_seg_error_straight_and_bent() {
        let straight: Vec<Point> = (0..12).map(|i| Point::new(20, 40 - i)).collect();
        let (e, _) = line_seg_error(&straight);
        assert!(e < 0.01);

        // 前半段向右偏, 后半段回到首尾连线
        let bent: Vec<Point> = (0..12u8)
            .map(|i| {
                let x = if i <= 6 { 20 + i } else { 26 - (i - 6) };
                Point::new(x, 40 - i * 2)
            })
            .collect();
        let (e, index) = line_seg_error(&bent);
        assert!(e >= 0.9);
        assert_eq!(index, 6);
    }

    #[test]
    fn test_bearing() {
        let p = Point::new(10, 20);
        // 向上
        assert_eq!(bearing(&p, &Point::new(10, 10), &p), 0);
        // 向左为正
        assert_eq!(bearing(&p, &Point::new(0, 20), &p), 90);
        assert_eq!(bearing(&Point::new(20, 20), &p, &p), -90);
        // 向下
        assert_eq!(bearing(&p, &Point::new(10, 30), &p), 180);
    }
}
