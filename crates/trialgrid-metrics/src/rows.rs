//! Little-endian binary rows for streamed metrics.
//!
//! ```text
//!   hardware  u8 v=1 │ u16 gpus │ f64 time │ u16 cpu │ u16 mem │ f32 rx │ f32 tx │ f32 blk_w │ f32 blk_r │ gpus × (u16 util │ u16 mem │ u16 temp │ u16 power)
//!   channel   i8 v=1 │ u16 n    │ f32 x    │ f32 time │ n × f32
//!   speed     u8 v=1 │ f64 x    │ f64 time │ f64 speed
//! ```

/// Append-only little-endian byte writer.
#[derive(Debug, Default)]
pub struct RowWriter {
    buf: Vec<u8>,
}

impl RowWriter {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn i8(&mut self, v: i8) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn f32(&mut self, v: f32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn f64(&mut self, v: f64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Scale a 0..=1 ratio onto 0..=65535.
pub fn scale_ratio(ratio: f64) -> u16 {
    if !ratio.is_finite() {
        return 0;
    }
    (ratio.clamp(0.0, 1.0) * 65535.0).round() as u16
}

fn clamp_u16(v: f64) -> u16 {
    if !v.is_finite() {
        return 0;
    }
    v.clamp(0.0, 65535.0).round() as u16
}

/// Per-GPU part of a hardware sample.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GpuSample {
    /// 0..=1
    pub utilization: f64,
    /// Used / total memory, 0..=1
    pub memory: f64,
    /// Degrees celsius.
    pub temperature: f64,
    /// Watts.
    pub power: f64,
}

/// One sample of an instance's resource usage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HardwareSample {
    /// Seconds since the epoch.
    pub time: f64,
    /// Utilization of the assigned cores, 0..=1
    pub cpu: f64,
    /// Memory usage / limit, 0..=1
    pub memory: f64,
    pub network_rx: f64,
    pub network_tx: f64,
    pub block_write: f64,
    pub block_read: f64,
    pub gpus: Vec<GpuSample>,
}

pub fn encode_hardware_row(sample: &HardwareSample) -> Vec<u8> {
    let mut w = RowWriter::with_capacity(31 + sample.gpus.len() * 8);
    w.u8(1)
        .u16(sample.gpus.len().min(u16::MAX as usize) as u16)
        .f64(sample.time)
        .u16(scale_ratio(sample.cpu))
        .u16(scale_ratio(sample.memory))
        .f32(sample.network_rx as f32)
        .f32(sample.network_tx as f32)
        .f32(sample.block_write as f32)
        .f32(sample.block_read as f32);
    for gpu in sample.gpus.iter().take(u16::MAX as usize) {
        w.u16(scale_ratio(gpu.utilization))
            .u16(scale_ratio(gpu.memory))
            .u16(clamp_u16(gpu.temperature))
            .u16(clamp_u16(gpu.power));
    }
    w.finish()
}

/// Row for a user channel: `x`, `time`, then one value per trace.
pub fn encode_channel_row(x: f64, time: f64, values: &[f64]) -> Vec<u8> {
    let count = values.len().min(u16::MAX as usize);
    let mut w = RowWriter::with_capacity(11 + count * 4);
    w.i8(1).u16(count as u16).f32(x as f32).f32(time as f32);
    for v in &values[..count] {
        w.f32(*v as f32);
    }
    w.finish()
}

pub fn encode_speed_row(x: f64, time: f64, speed: f64) -> Vec<u8> {
    let mut w = RowWriter::with_capacity(25);
    w.u8(1).f64(x).f64(time).f64(speed);
    w.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u16_at(b: &[u8], at: usize) -> u16 {
        u16::from_le_bytes([b[at], b[at + 1]])
    }

    fn f32_at(b: &[u8], at: usize) -> f32 {
        f32::from_le_bytes(b[at..at + 4].try_into().unwrap())
    }

    fn f64_at(b: &[u8], at: usize) -> f64 {
        f64::from_le_bytes(b[at..at + 8].try_into().unwrap())
    }

    #[test]
    fn hardware_row_layout() {
        let sample = HardwareSample {
            time: 1_700_000_000.5,
            cpu: 0.5,
            memory: 1.7,
            network_rx: 1024.0,
            network_tx: 2048.0,
            block_write: 10.0,
            block_read: 20.0,
            gpus: vec![GpuSample {
                utilization: 1.0,
                memory: 0.25,
                temperature: 71.0,
                power: 250.4,
            }],
        };
        let row = encode_hardware_row(&sample);
        assert_eq!(row.len(), 31 + 8);
        assert_eq!(row[0], 1);
        assert_eq!(u16_at(&row, 1), 1);
        assert_eq!(f64_at(&row, 3), 1_700_000_000.5);
        assert_eq!(u16_at(&row, 11), 32768);
        assert_eq!(u16_at(&row, 13), 65535);
        assert_eq!(f32_at(&row, 15), 1024.0);
        assert_eq!(f32_at(&row, 27), 20.0);
        assert_eq!(u16_at(&row, 31), 65535);
        assert_eq!(u16_at(&row, 33), 16384);
        assert_eq!(u16_at(&row, 35), 71);
        assert_eq!(u16_at(&row, 37), 250);
    }

    #[test]
    fn channel_row_counts_values() {
        let row = encode_channel_row(3.0, 12.5, &[0.1, 0.2]);
        assert_eq!(row.len(), 1 + 2 + 4 * 4);
        assert_eq!(row[0] as i8, 1);
        assert_eq!(u16_at(&row, 1), 2);
        assert_eq!(f32_at(&row, 3), 3.0);
        assert_eq!(f32_at(&row, 7), 12.5);
        assert_eq!(f32_at(&row, 15), 0.2f32);
    }

    #[test]
    fn speed_row_is_three_doubles() {
        let row = encode_speed_row(4.0, 10.0, 128.5);
        assert_eq!(row.len(), 25);
        assert_eq!(f64_at(&row, 17), 128.5);
    }

    #[test]
    fn ratio_scaling_clamps() {
        assert_eq!(scale_ratio(-1.0), 0);
        assert_eq!(scale_ratio(2.0), 65535);
        assert_eq!(scale_ratio(f64::NAN), 0);
    }
}
