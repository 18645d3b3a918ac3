//! Resampling und Downmix
//!
//! Gerätekonfigurationen treffen die 16/24 kHz des Wire-Formats selten
//! exakt. Ein Datenstrom (Mikrofon, Lautsprecher) besitzt genau einen
//! [`StreamResampler`], der seinen Zustand über Callback-Grenzen hinweg
//! behält; Puffergrenzen erzeugen so keinen Phasensprung.
//!
//! Primär läuft rubato (Sinc-Interpolation). Lässt sich rubato nicht
//! konstruieren oder schlägt es fehl, übernimmt lineare Interpolation
//! mit derselben durchgehenden Phase.

use rubato::{InterpolationParameters, InterpolationType, Resampler, SincFixedIn, WindowFunction};

/// Eingabe-Frames pro rubato-Durchlauf
pub const RESAMPLE_CHUNK: usize = 256;

// ============================================================================
// ONE-SHOT
// ============================================================================

/// Resampled einen einzelnen, abgeschlossenen Puffer von `from` Hz auf `to` Hz
///
/// Nur für Puffer ohne Vorgänger/Nachfolger; Streams nutzen [`StreamResampler`].
pub fn resample_linear(input: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || from == 0 || to == 0 || input.is_empty() {
        return input.to_vec();
    }

    let ratio = to as f64 / from as f64;
    let new_len = (input.len() as f64 * ratio).round() as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f64 / ratio;
            let idx = src_idx as usize;
            let frac = (src_idx - idx as f64) as f32;
            let s1 = input.get(idx).copied().unwrap_or(0.0);
            let s2 = input.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}

/// Interleaved Mehrkanal -> Mono (Mittelwert)
pub fn downmix_to_mono(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

// ============================================================================
// STREAM RESAMPLER
// ============================================================================

/// Zustandsbehafteter Mono-Resampler für einen fortlaufenden Datenstrom
pub struct StreamResampler {
    from: u32,
    to: u32,
    engine: Engine,
}

enum Engine {
    Passthrough,
    Sinc(SincStream),
    Linear(LinearStream),
}

impl StreamResampler {
    /// rubato für `from` -> `to`; lineares Fallback wenn rubato ablehnt
    pub fn new(from: u32, to: u32) -> Self {
        if from == to || from == 0 || to == 0 {
            return Self {
                from,
                to,
                engine: Engine::Passthrough,
            };
        }

        let engine = match SincStream::new(from, to) {
            Ok(sinc) => Engine::Sinc(sinc),
            Err(e) => {
                tracing::warn!(
                    "High-quality resampler unavailable for {} -> {} Hz ({}), using linear",
                    from,
                    to,
                    e
                );
                Engine::Linear(LinearStream::default())
            }
        };

        Self { from, to, engine }
    }

    /// Nur lineare Interpolation, ohne rubato
    pub fn linear(from: u32, to: u32) -> Self {
        let engine = if from == to || from == 0 || to == 0 {
            Engine::Passthrough
        } else {
            Engine::Linear(LinearStream::default())
        };
        Self { from, to, engine }
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self.engine, Engine::Passthrough)
    }

    pub fn rates(&self) -> (u32, u32) {
        (self.from, self.to)
    }

    /// Verarbeitet den nächsten Abschnitt des Streams
    ///
    /// Die Ausgabe kann kürzer sein als `input * to / from`; der Rest folgt
    /// mit dem nächsten Aufruf.
    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        let (from, to) = (self.from, self.to);
        match &mut self.engine {
            Engine::Passthrough => input.to_vec(),
            Engine::Linear(linear) => linear.process(input, from, to),
            Engine::Sinc(sinc) => match sinc.process(input) {
                Ok(out) => out,
                Err(e) => {
                    tracing::warn!("Resampler failed ({}), falling back to linear", e);
                    // Noch gepufferte Eingabe geht an den linearen Pfad
                    let mut rest = std::mem::take(&mut sinc.pending);
                    rest.extend_from_slice(input);
                    let mut linear = LinearStream::default();
                    let out = linear.process(&rest, from, to);
                    self.engine = Engine::Linear(linear);
                    out
                }
            },
        }
    }
}

// ============================================================================
// RUBATO
// ============================================================================

struct SincStream {
    resampler: SincFixedIn<f32>,
    /// Eingabe, die noch keinen vollen Chunk ergibt
    pending: Vec<f32>,
    segment: Vec<f32>,
}

impl SincStream {
    fn new(from: u32, to: u32) -> Result<Self, String> {
        let params = InterpolationParameters {
            sinc_len: 64,
            f_cutoff: 0.90,
            interpolation: InterpolationType::Cubic,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };
        let ratio = to as f64 / from as f64;
        let resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, RESAMPLE_CHUNK, 1)
            .map_err(|e| format!("{e:?}"))?;

        Ok(Self {
            resampler,
            pending: Vec::with_capacity(RESAMPLE_CHUNK * 2),
            segment: vec![0.0; RESAMPLE_CHUNK],
        })
    }

    fn process(&mut self, input: &[f32]) -> Result<Vec<f32>, String> {
        self.pending.extend_from_slice(input);

        let mut out = Vec::new();
        let mut offset = 0;
        while self.pending.len() - offset >= RESAMPLE_CHUNK {
            self.segment
                .copy_from_slice(&self.pending[offset..offset + RESAMPLE_CHUNK]);
            let produced = self
                .resampler
                .process(std::slice::from_ref(&self.segment), None)
                .map_err(|e| format!("{e:?}"))?;
            if let Some(channel) = produced.first() {
                out.extend_from_slice(channel);
            }
            offset += RESAMPLE_CHUNK;
        }
        self.pending.drain(..offset);

        Ok(out)
    }
}

// ============================================================================
// LINEAR FALLBACK
// ============================================================================

/// Lineare Interpolation auf einem absoluten Raster
///
/// Ausgabe-Sample `k` liegt bei Eingabe-Position `k * from / to`, gerechnet
/// in Ganzzahlen über den gesamten Stream.
#[derive(Default)]
struct LinearStream {
    produced: u64,
    consumed: u64,
    last: Option<f32>,
}

impl LinearStream {
    fn process(&mut self, input: &[f32], from: u32, to: u32) -> Vec<f32> {
        if input.is_empty() {
            return Vec::new();
        }

        let (from, to) = (from as u64, to as u64);
        let available = self.consumed + input.len() as u64;
        let sample = |abs: u64| -> f32 {
            if abs < self.consumed {
                self.last.unwrap_or(input[0])
            } else {
                input[(abs - self.consumed) as usize]
            }
        };

        let mut out = Vec::with_capacity((input.len() as u64 * to / from) as usize + 1);
        loop {
            let pos = self.produced * from;
            let idx = pos / to;
            if idx + 1 >= available {
                break;
            }
            let frac = (pos % to) as f32 / to as f32;
            let s1 = sample(idx);
            let s2 = sample(idx + 1);
            out.push(s1 + (s2 - s1) * frac);
            self.produced += 1;
        }

        self.consumed = available;
        self.last = input.last().copied();
        out
    }
}
