use clap::Parser as ClapParser;
use std::process;

use nativebridge::{
    Capacities, current, demo,
    host::{self, HostConfig},
};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Frames to run the spawned scripts for
    #[arg(long, default_value_t = 60)]
    frames: u32,

    /// Reloads spread evenly over the run
    #[arg(long, default_value_t = 1)]
    reloads: u32,

    /// Scripts the managed side spawns
    #[arg(long, default_value_t = 3)]
    scripts: u32,

    /// Damage dealt to every script per frame
    #[arg(long, default_value_t = 0.25)]
    damage: f32,

    #[arg(long, default_value_t = 1024, help = "Managed object handle capacity")]
    max_managed_objects: usize,

    #[arg(long, default_value_t = 32, help = "RaycastHit handle capacity")]
    max_raycast_hits: usize,

    #[arg(long, default_value_t = 16, help = "BaseScript pool capacity")]
    max_base_scripts: usize,

    #[arg(long, default_value_t = 32, help = "Action pool capacity")]
    max_actions: usize,

    /// Extra bytes lent to the plugin past the bridge's working memory
    #[arg(long, default_value_t = 1024)]
    plugin_memory: usize,

    /// Start the lent region this many bytes past a 16-byte boundary
    #[arg(long, default_value_t = 0)]
    skew: usize,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let config = HostConfig {
        capacities: Capacities {
            managed_objects: cli.max_managed_objects,
            raycast_hits: cli.max_raycast_hits,
            base_scripts: cli.max_base_scripts,
            actions: cli.max_actions,
        },
        base_script_slot_size: demo::BASE_SCRIPT_SLOT_SIZE,
        plugin_memory: cli.plugin_memory,
        memory_size: None,
        skew: cli.skew,
    };
    println!(
        "lending {} bytes ({} for the bridge)",
        config.memory_size(),
        config.required_memory()
    );

    let session = host::boot(&config, nativebridge::Init);
    if let Some(exception) = host::take_exception() {
        eprintln!("Init failed: {exception}");
        process::exit(1);
    }

    let mut scripts = Vec::new();
    for _ in 0..cli.scripts {
        match host::create_base_script() {
            Ok(handle) => scripts.push(handle),
            Err(exception) => {
                eprintln!("spawning a script failed: {exception}");
                process::exit(1);
            }
        }
    }

    let reload_every = cli.frames / (cli.reloads + 1);
    let mut respawned = 0;
    for frame in 1..=cli.frames {
        for script in scripts.iter_mut() {
            if let Err(exception) = host::update(*script) {
                eprintln!("frame {frame}: Update threw {exception}");
                process::exit(1);
            }
            match host::receive_damage(*script, cli.damage) {
                Ok(false) => {}
                Ok(true) => {
                    let respawn = host::destroy_base_script(*script)
                        .and_then(|()| host::create_base_script());
                    match respawn {
                        Ok(handle) => {
                            *script = handle;
                            respawned += 1;
                        }
                        Err(exception) => {
                            eprintln!("frame {frame}: respawn failed: {exception}");
                            process::exit(1);
                        }
                    }
                }
                Err(exception) => {
                    eprintln!("frame {frame}: ReceiveDamage threw {exception}");
                    process::exit(1);
                }
            }
        }
        if reload_every > 0 && frame % reload_every == 0 && frame < cli.frames {
            log::info!("reloading at frame {frame}");
            session.reload();
            if let Some(exception) = host::take_exception() {
                eprintln!("reload failed: {exception}");
                process::exit(1);
            }
        }
    }

    print_stats(respawned);

    for script in scripts {
        if let Err(exception) = host::destroy_base_script(script) {
            eprintln!("destroying script {script} failed: {exception}");
        }
    }
    drop(session);
}

fn print_stats(respawned: u32) {
    let Ok(context) = current() else {
        eprintln!("no bridge context installed");
        return;
    };
    // SAFETY: the plugin is not running, nothing else views its memory
    let boots = demo::boot_count(unsafe { context.plugin_memory() });
    println!("== bridge ==");
    println!("  object handles held:    {}", context.objects.live());
    println!("  raycast hits held:      {}", context.raycast_hits.live());
    println!("  action classes held:    {}", context.action_classes.live());
    println!(
        "  BaseScript instances:   {} of {}",
        context.base_script_pointers.occupied_len(),
        context.capacities.base_scripts.saturating_sub(1)
    );
    println!("  native actions:         {}", context.actions.occupied_len());
    println!("  PluginMain runs:        {}", boots.unwrap_or(0));
    println!("== managed host ==");
    println!("  live handles:           {}", host::live_handles());
    println!("  ReleaseObject calls:    {}", host::released_objects().len());
    println!("  BaseScripts released:   {}", host::released_base_scripts().len());
    println!("  scripts respawned:      {respawned}");
}
