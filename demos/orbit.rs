//! Orbits a few procedurally generated cubes. Expects precompiled shaders in `./shaders`.
//!
//! Keys: 1 SSAO, 2 SSR, 3 FXAA, 4 bloom, 5 motion blur, 6 shadows, 7 compute, L load, U unload.
use std::{path::Path, time::Instant};

use deferred_vulkan::{
    DeferredVulkan, FrameState, Light, LoadError, MeshData, ModelData, Primitive, RenderSettings,
    Vertex,
};
use glam::{Mat4, Vec3, Vec4};
use winit::{
    application::ApplicationHandler,
    event::{ElementState, KeyEvent, WindowEvent},
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Window, WindowId},
};

/// Stands in for a real asset importer: every name becomes a unit cube.
fn load_cube(_folder: &Path, name: &str) -> Result<ModelData, LoadError> {
    let faces = [
        (Vec3::X, Vec3::Y),
        (-Vec3::X, Vec3::Y),
        (Vec3::Y, Vec3::Z),
        (-Vec3::Y, Vec3::Z),
        (Vec3::Z, Vec3::Y),
        (-Vec3::Z, Vec3::Y),
    ];
    let mut vertices = Vec::new();
    let mut indices = Vec::new();
    for (normal, up) in faces {
        let right = up.cross(normal);
        let base = vertices.len() as u32;
        for (u, v) in [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)] {
            let position = (normal + right * (u * 2.0 - 1.0) + up * (v * 2.0 - 1.0)) * 0.5;
            vertices.push(Vertex {
                position: position.to_array(),
                uv: [u, v],
                normal: normal.to_array(),
                tangent: right.extend(1.0).to_array(),
                colour: [1.0; 4],
            });
        }
        indices.extend([base, base + 1, base + 2, base, base + 2, base + 3]);
    }

    Ok(ModelData {
        name: name.to_string(),
        meshes: vec![MeshData {
            name: format!("{name} mesh"),
            transform: Mat4::IDENTITY,
            base_colour_factor: Vec4::new(0.8, 0.3, 0.2, 1.0),
            base_colour: None,
            primitives: vec![Primitive {
                first_index: 0,
                index_count: indices.len() as u32,
                render: true,
            }],
        }],
        vertices,
        indices,
    })
}

struct App {
    renderer: Option<DeferredVulkan>,
    start: Instant,
    last_frame: Instant,
    loaded: usize,
}

impl Default for App {
    fn default() -> Self {
        Self {
            renderer: None,
            start: Instant::now(),
            last_frame: Instant::now(),
            loaded: 0,
        }
    }
}

impl App {
    fn toggle(&mut self, key: KeyCode) {
        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };
        let mut settings = renderer.settings().clone();
        match key {
            KeyCode::Digit1 => settings.ssao = !settings.ssao,
            KeyCode::Digit2 => settings.ssr = !settings.ssr,
            KeyCode::Digit3 => settings.fxaa = !settings.fxaa,
            KeyCode::Digit4 => settings.bloom = !settings.bloom,
            KeyCode::Digit5 => settings.motion_blur = !settings.motion_blur,
            KeyCode::Digit6 => settings.shadow_cast = !settings.shadow_cast,
            KeyCode::Digit7 => settings.use_compute = !settings.use_compute,
            KeyCode::KeyL => {
                renderer.load_model("models", &format!("cube{}.gltf", self.loaded));
                self.loaded += 1;
                return;
            }
            KeyCode::KeyU => {
                renderer.unload_model(0);
                return;
            }
            _ => return,
        }
        if let Err(e) = renderer.set_settings(settings) {
            log::error!("Couldn't apply settings: {e}");
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        let window = event_loop
            .create_window(Window::default_attributes().with_title("deferred_vulkan"))
            .unwrap();
        let mut renderer = DeferredVulkan::new(window, RenderSettings::default(), load_cube).unwrap();
        for _ in 0..3 {
            renderer.load_model("models", &format!("cube{}.gltf", self.loaded));
            self.loaded += 1;
        }
        self.renderer = Some(renderer);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested
            | WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        state: ElementState::Pressed,
                        physical_key: PhysicalKey::Code(KeyCode::Escape),
                        ..
                    },
                ..
            } => event_loop.exit(),
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        state: ElementState::Pressed,
                        physical_key: PhysicalKey::Code(key),
                        repeat: false,
                        ..
                    },
                ..
            } => self.toggle(key),
            WindowEvent::Resized(size) => {
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.resize(size.width, size.height);
                }
            }
            _ => (),
        }
    }

    fn about_to_wait(&mut self, _: &ActiveEventLoop) {
        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };
        let now = Instant::now();
        let time = (now - self.start).as_secs_f32();
        let delta_time = (now - self.last_frame).as_secs_f32();
        self.last_frame = now;

        for (i, model) in renderer.scene_mut().models.iter_mut().enumerate() {
            let angle = time + i as f32;
            model.transform = Mat4::from_translation(Vec3::new(i as f32 * 1.5 - 1.5, 0.5, 0.0))
                * Mat4::from_rotation_y(angle);
        }

        let camera_position = Vec3::new(6.0 * (time * 0.2).cos(), 3.0, 6.0 * (time * 0.2).sin());
        let size = renderer.window.inner_size();
        let state = FrameState {
            view: Mat4::look_at_rh(camera_position, Vec3::ZERO, Vec3::Y),
            projection: Mat4::perspective_rh(
                60f32.to_radians(),
                size.width.max(1) as f32 / size.height.max(1) as f32,
                0.1,
                100.0,
            ),
            camera_position,
            lights: vec![Light::directional(
                Vec3::new(5.0, 10.0, 5.0),
                Vec3::ZERO,
                Vec3::ONE,
                3.0,
                20.0,
            )],
            delta_time,
            time,
        };
        renderer.draw(&state);
    }
}

pub fn main() {
    env_logger::init();

    let event_loop = EventLoop::builder().build().unwrap();
    event_loop.set_control_flow(ControlFlow::Poll);
    event_loop.run_app(&mut App::default()).unwrap();
}
