/// Running average of a scalar
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AverageMeter {
    pub val: f64,
    pub sum: f64,
    pub count: usize,
    pub avg: f64,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn update(&mut self, val: f64) {
        self.update_n(val, 1);
    }

    /// `val` is the mean over `n` items
    pub fn update_n(&mut self, val: f64, n: usize) {
        self.val = val;
        self.sum += val * n as f64;
        self.count += n;
        if self.count > 0 {
            self.avg = self.sum / self.count as f64;
        }
    }
}

#[test]
fn meter_averages() {
    let mut m = AverageMeter::new();
    m.update(1.0);
    m.update_n(4.0, 3);
    assert_eq!(m.count, 4);
    assert_eq!(m.val, 4.0);
    assert!((m.avg - 13.0 / 4.0).abs() < 1e-12);
    m.reset();
    assert_eq!(m, AverageMeter::default());
}
