use std::sync::Arc;
use std::time::{Duration, Instant};

use residency::prelude::*;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

const TEXTURE_BUDGET: u64 = 48 << 20;
const FRAME_TIME: Duration = Duration::from_millis(16);
const POST_SYNC_SLICE: Duration = Duration::from_millis(2);

/// Synthetic RGBA8 texture, decoded by filling a buffer
struct Texture {
    width: usize,
    height: usize,
}

impl Asset for Texture {
    type Data = Vec<u8>;

    fn load(&self) -> anyhow::Result<Vec<u8>> {
        // stand in for decode time
        std::thread::sleep(Duration::from_millis(1));
        Ok(vec![0x7f; self.width * self.height * 4])
    }

    fn size_of(&self, data: &Vec<u8>) -> usize {
        data.len()
    }
}

/// Synthetic mesh with a fixed vertex count
struct Mesh {
    vertices: usize,
}

impl Asset for Mesh {
    type Data = Vec<[f32; 8]>;

    fn load(&self) -> anyhow::Result<Vec<[f32; 8]>> {
        Ok(vec![[0.0; 8]; self.vertices])
    }

    fn size_of(&self, data: &Vec<[f32; 8]>) -> usize {
        std::mem::size_of_val(data.as_slice())
    }
}

fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let registry = ManagerRegistry::new();
    let textures: Arc<ResourceManager<Texture>> = registry.create_manager(
        ManagerConfig::asynchronous("textures", TEXTURE_BUDGET)
            .with_maintenance_interval(Duration::from_millis(100)),
    )?;
    let meshes: Arc<ResourceManager<Mesh>> =
        registry.create_manager(ManagerConfig::sync("meshes"))?;

    let mut texture_set = Vec::new();
    for index in 0..32 {
        let side = 256 << (index % 3);
        let texture = Resource::new(
            format!("texture_{index}"),
            Texture {
                width: side,
                height: side,
            },
        );
        textures.notify_new_resource(&texture)?;
        texture_set.push(texture);
    }
    let mut mesh_set = Vec::new();
    for index in 0..8 {
        let mesh = Resource::new(
            format!("mesh_{index}"),
            Mesh {
                vertices: (index + 1) * 1024,
            },
        );
        meshes.notify_new_resource(&mesh)?;
        mesh_set.push(mesh);
    }

    // a camera sweeping across the scene, each frame sees a window of textures
    for frame in 0..120usize {
        let start = Instant::now();
        let window = frame / 4;
        for texture in texture_set.iter().cycle().skip(window).take(12) {
            texture.request_use()?;
        }
        for mesh in mesh_set.iter().skip(frame % 4).step_by(2) {
            meshes.touch(mesh)?;
        }

        registry.perform_all_post_sync(POST_SYNC_SLICE);
        registry.update_all(start);
        if frame % 30 == 0 {
            for diagnostics in registry.diagnostics() {
                tracing::info!("{diagnostics}");
            }
        }
        std::thread::sleep(FRAME_TIME.saturating_sub(start.elapsed()));
    }

    textures.wait_for_idle();
    meshes.wait_for_idle();
    for diagnostics in registry.diagnostics() {
        tracing::info!("{diagnostics}");
    }
    if let Some(texture) = textures.exists("texture_0") {
        tracing::info!(state = ?texture.state(), "texture_0 after the sweep");
    }

    for texture in texture_set.iter() {
        textures.notify_release_resource(texture)?;
    }
    for mesh in mesh_set.iter() {
        meshes.notify_release_resource(mesh)?;
    }
    registry.shutdown_all();
    Ok(())
}
