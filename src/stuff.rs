//! Packet stuffing: absorbing clock drift one sample at a time.
//!
//! A stuff directive of +1 or -1 turns a frame of `F` stereo samples
//! into `F ± 1` by inserting an interpolated sample at a random
//! interior position, or dropping one. Software volume with triangular
//! dither is applied on the same pass. With the `soxr` feature the
//! whole frame can instead be resampled at high quality.

use rand::Rng;
use tracing::trace;

/// `fix_volume` value meaning no attenuation; dither is bypassed.
pub(crate) const UNITY_VOLUME: i32 = 0x10000;

/// Software volume floor, hundredths of a dB: a 16-bit multiplier
/// spans about 48.1 dB.
const SOFTWARE_ATTENUATION_RANGE_DB: f64 = -4810.0;

/// Software attenuation for an airplay volume, in hundredths of a dB.
///
/// The `-30..=0` slider range maps linearly onto the software range;
/// anything below the slider floor saturates at full attenuation.
pub(crate) fn airplay_to_attenuation(airplay_db: f64) -> f64 {
    let v = airplay_db.clamp(-30.0, 0.0);
    (v / -30.0) * SOFTWARE_ATTENUATION_RANGE_DB
}

/// Map an airplay volume (`-144` or `-30..=0` dB) onto a linear gain
/// in `[0, 1]`; `-144` is a hard mute.
pub(crate) fn airplay_to_linear(airplay_db: f64) -> f64 {
    if airplay_db == -144.0 {
        return 0.0;
    }
    10f64.powf(airplay_to_attenuation(airplay_db) / 1000.0)
}

/// Triangular-dither state for the software volume.
///
/// Two successive outputs of the fixed LCG `s <- 69069*s + 3` are added
/// and subtracted around each scaled sample. The history values are
/// zeroed at the start of every pass; the LCG state itself runs on.
pub(crate) struct Dither {
    lcg: u32,
    rand_a: i16,
    rand_b: i16,
}

impl Dither {
    pub fn new() -> Self {
        Self {
            lcg: 12345,
            rand_a: 0,
            rand_b: 0,
        }
    }

    fn begin_pass(&mut self) {
        self.rand_a = 0;
        self.rand_b = 0;
    }

    fn next(&mut self) -> i16 {
        self.lcg = self.lcg.wrapping_mul(69069).wrapping_add(3);
        (self.lcg & 0xffff) as u16 as i16
    }

    /// Scale one sample by `fix_volume`, dithering unless at unity.
    #[inline]
    fn sample(&mut self, s: i16, fix_volume: i32) -> i16 {
        let mut out = s as i64 * fix_volume as i64;
        if fix_volume < UNITY_VOLUME {
            self.rand_b = self.rand_a;
            self.rand_a = self.next();
            out += self.rand_a as i64;
            out -= self.rand_b as i64;
        }
        (out >> 16) as i16
    }
}

#[inline]
fn short_mean(a: i16, b: i16) -> i16 {
    ((a as i32 + b as i32) / 2) as i16
}

/// Copy a frame while inserting or deleting one stereo sample.
///
/// `stuff` must be -1, 0 or +1. The insertion point is a random
/// interior index so repeated corrections never land on the frame
/// edge; an inserted sample is the per-channel mean of the two samples
/// it lands between. Returns the number of stereo samples written.
pub(crate) fn stuff_buffer_basic(
    input: &[i16],
    output: &mut [i16],
    stuff: i32,
    fix_volume: i32,
    dither: &mut Dither,
) -> usize {
    let frames = input.len() / 2;
    debug_assert!((-1..=1).contains(&stuff));
    dither.begin_pass();

    let stuffsamp = if stuff != 0 {
        // always a sample on both sides of the edit
        rand::thread_rng().gen_range(1..frames - 1)
    } else {
        frames
    };

    let mut inp = 0;
    let mut outp = 0;
    for _ in 0..stuffsamp {
        output[outp] = dither.sample(input[inp], fix_volume);
        output[outp + 1] = dither.sample(input[inp + 1], fix_volume);
        inp += 2;
        outp += 2;
    }

    if stuff != 0 {
        if stuff == 1 {
            trace!("+++++++++");
            output[outp] = dither.sample(short_mean(input[inp - 2], input[inp]), fix_volume);
            output[outp + 1] = dither.sample(short_mean(input[inp - 1], input[inp + 1]), fix_volume);
            outp += 2;
        } else {
            trace!("---------");
            inp += 2;
        }
        while inp < input.len() {
            output[outp] = dither.sample(input[inp], fix_volume);
            output[outp + 1] = dither.sample(input[inp + 1], fix_volume);
            inp += 2;
            outp += 2;
        }
    }

    (frames as i64 + stuff as i64) as usize
}

/// Resample the whole frame from `F` to `F + stuff` stereo samples.
///
/// The first and last few samples are carried over verbatim from the
/// input to keep the resampler's edge ringing out of the output.
/// Falls back to the basic strategy if the resampler refuses.
#[cfg(feature = "soxr")]
pub(crate) fn stuff_buffer_soxr(
    input: &[i16],
    output: &mut [i16],
    stuff: i32,
    fix_volume: i32,
    dither: &mut Dither,
) -> usize {
    use rubato::{
        Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
    };

    let frames = input.len() / 2;
    debug_assert!((-1..=1).contains(&stuff));
    if stuff == 0 {
        return stuff_buffer_basic(input, output, 0, fix_volume, dither);
    }
    let want = (frames as i64 + stuff as i64) as usize;

    let params = SincInterpolationParameters {
        sinc_len: 64,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 128,
        window: WindowFunction::BlackmanHarris2,
    };
    let mut resampler =
        match SincFixedIn::<f32>::new(want as f64 / frames as f64, 1.1, params, frames, 2) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("resampler setup failed, using basic stuffing: {e}");
                return stuff_buffer_basic(input, output, stuff, fix_volume, dither);
            }
        };

    let mut channels = vec![Vec::with_capacity(frames), Vec::with_capacity(frames)];
    for pair in input.chunks_exact(2) {
        channels[0].push(pair[0] as f32);
        channels[1].push(pair[1] as f32);
    }

    let delay = resampler.output_delay();
    let mut waves = match resampler.process(&channels, None) {
        Ok(w) => w,
        Err(e) => {
            tracing::warn!("resampling failed, using basic stuffing: {e}");
            return stuff_buffer_basic(input, output, stuff, fix_volume, dither);
        }
    };
    if let Ok(tail) = resampler.process_partial(Option::<&[Vec<f32>]>::None, None) {
        for (wave, mut extra) in waves.iter_mut().zip(tail) {
            wave.append(&mut extra);
        }
    }

    for ch in 0..2 {
        let wave = &waves[ch];
        for i in 0..want {
            let sample = wave
                .get(delay + i)
                .or_else(|| wave.last())
                .copied()
                .unwrap_or(0.0);
            output[2 * i + ch] = sample.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        }
    }

    // keep the edges verbatim to mitigate the Gibbs phenomenon
    const EDGE: usize = 5;
    for i in 0..EDGE.min(want).min(frames) {
        output[2 * i] = input[2 * i];
        output[2 * i + 1] = input[2 * i + 1];
    }
    for i in 0..EDGE.min(want).min(frames) {
        output[2 * (want - 1 - i)] = input[2 * (frames - 1 - i)];
        output[2 * (want - 1 - i) + 1] = input[2 * (frames - 1 - i) + 1];
    }

    if fix_volume != UNITY_VOLUME {
        dither.begin_pass();
        for sample in output[..2 * want].iter_mut() {
            *sample = dither.sample(*sample, fix_volume);
        }
    }

    want
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(frames: usize) -> Vec<i16> {
        (0..2 * frames as i16).collect()
    }

    #[test]
    fn test_identity_at_unity_volume() {
        let input = ramp(352);
        let mut output = vec![0i16; 2 * 353];
        let mut dither = Dither::new();
        let n = stuff_buffer_basic(&input, &mut output, 0, UNITY_VOLUME, &mut dither);
        assert_eq!(n, 352);
        assert_eq!(&output[..input.len()], &input[..]);
    }

    #[test]
    fn test_insert_adds_one_interpolated_sample() {
        let input = ramp(352);
        let mut output = vec![0i16; 2 * 353];
        let mut dither = Dither::new();
        let n = stuff_buffer_basic(&input, &mut output, 1, UNITY_VOLUME, &mut dither);
        assert_eq!(n, 353);

        // find the insertion point: first stereo sample that differs
        let k = (0..352)
            .find(|&i| output[2 * i] != input[2 * i] || output[2 * i + 1] != input[2 * i + 1])
            .expect("an inserted sample somewhere");
        assert!(k >= 1 && k <= 350);
        assert_eq!(output[2 * k], short_mean(input[2 * k - 2], input[2 * k]));
        assert_eq!(
            output[2 * k + 1],
            short_mean(input[2 * k - 1], input[2 * k + 1])
        );
        // tail is the input shifted right by one stereo sample
        assert_eq!(&output[2 * (k + 1)..2 * 353], &input[2 * k..]);
    }

    #[test]
    fn test_delete_removes_one_sample() {
        let input = ramp(352);
        let mut output = vec![0i16; 2 * 353];
        let mut dither = Dither::new();
        let n = stuff_buffer_basic(&input, &mut output, -1, UNITY_VOLUME, &mut dither);
        assert_eq!(n, 351);

        let k = (0..351)
            .find(|&i| output[2 * i] != input[2 * i] || output[2 * i + 1] != input[2 * i + 1])
            .expect("a dropped sample somewhere");
        assert!(k >= 1 && k <= 350);
        // tail is the input shifted left by one stereo sample
        assert_eq!(&output[2 * k..2 * 351], &input[2 * (k + 1)..]);
    }

    #[test]
    fn test_half_volume_halves_amplitude() {
        let input = vec![1000i16; 2 * 64];
        let mut output = vec![0i16; 2 * 64];
        let mut dither = Dither::new();
        let n = stuff_buffer_basic(&input, &mut output, 0, UNITY_VOLUME / 2, &mut dither);
        assert_eq!(n, 64);
        for &s in &output {
            assert!((s - 500).abs() <= 1, "got {s}");
        }
    }

    #[test]
    fn test_lcg_sequence() {
        let mut dither = Dither::new();
        // 12345 * 69069 + 3 = 852_656_808; low 16 bits reinterpreted signed
        assert_eq!(dither.next(), -32_088);
    }

    #[test]
    fn test_short_mean_truncates_toward_zero() {
        assert_eq!(short_mean(3, 4), 3);
        assert_eq!(short_mean(-3, -4), -3);
        assert_eq!(short_mean(i16::MAX, i16::MAX), i16::MAX);
        assert_eq!(short_mean(i16::MIN, i16::MIN), i16::MIN);
    }

    #[test]
    fn test_airplay_volume_mapping() {
        assert_eq!(airplay_to_linear(0.0), 1.0);
        assert_eq!(airplay_to_linear(-144.0), 0.0);
        // full software range is about -48.1 dB, i.e. 1/65536
        let floor = airplay_to_linear(-30.0);
        assert!((floor - 10f64.powf(-4.81)).abs() < 1e-9);
        // monotonic over the slider range
        assert!(airplay_to_linear(-10.0) > airplay_to_linear(-20.0));
    }

    #[cfg(feature = "soxr")]
    #[test]
    fn test_soxr_length_and_edges() {
        let input = ramp(352);
        let mut output = vec![0i16; 2 * 353];
        let mut dither = Dither::new();
        let n = stuff_buffer_soxr(&input, &mut output, 1, UNITY_VOLUME, &mut dither);
        assert_eq!(n, 353);
        assert_eq!(&output[..10], &input[..10]);
        assert_eq!(&output[2 * 353 - 10..2 * 353], &input[2 * 352 - 10..]);
    }
}
