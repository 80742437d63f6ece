//! Bright room, then a dark corridor: prints how the exposure follows.
//!
//! Runs on the CPU backend, so no GPU is needed. Pass a path to an image to
//! use it as the bright scene instead of the synthetic one.
//!
//! ```text
//! cargo run --example headless_exposure [image]
//! ```

use eyelight::{PostProcessSettings, SoftwareImage, SoftwareRenderer};

const FRAME_DELTA: f32 = 1.0 / 30.0;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let bright = match std::env::args().nth(1) {
        Some(path) => SoftwareImage::from_dynamic(&image::open(path)?),
        None => SoftwareImage::from_fn(320, 180, |x, y| {
            // Sky gradient over a mid-gray floor
            if y < 90 {
                let v = 4.0 + x as f32 / 80.0;
                [v * 0.8, v * 0.9, v, 1.0]
            } else {
                [0.6, 0.55, 0.5, 1.0]
            }
        }),
    };
    let dark = SoftwareImage::from_fn(320, 180, |x, _| {
        let v = if (140..180).contains(&x) { 0.2 } else { 0.02 };
        [v, v, v * 1.1, 1.0]
    });

    let settings = PostProcessSettings::default()
        .with_adaptation_range(0.03, 8.0)
        .with_speeds(3.0, 1.0);
    let mut renderer = SoftwareRenderer::new(settings)?;

    println!("{:>5}  {:>6}  {:>10}  {:>8}", "frame", "scene", "luminance", "exposure");
    for frame in 0..180 {
        let (name, scene) = if frame < 60 { ("bright", &bright) } else { ("dark", &dark) };
        renderer.render(scene, FRAME_DELTA)?;

        if frame % 10 == 0 {
            let luminance = renderer.adapted_luminance().unwrap_or_default();
            let exposure = renderer.exposure().unwrap_or_default();
            println!("{frame:>5}  {name:>6}  {luminance:>10.4}  {exposure:>8.4}");
        }
    }

    Ok(())
}
