use std::error::Error;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use coderoom::api::{HttpRoomApi, RoomApi};
use coderoom::room::{Identity, NewRoom, Room};
use coderoom::{server, tui};

#[derive(Parser, Debug)]
#[command(name = "coderoom", version, about = "Collaborative code rooms over TCP")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the collaboration relay
    Serve {
        /// Address to bind (e.g. 0.0.0.0:4000)
        #[arg(long, default_value = "0.0.0.0:4000")]
        addr: String,
        /// Directory for room snapshots
        #[arg(long, default_value = "data")]
        data_dir: String,
    },
    /// Open a room in the terminal editor
    Edit {
        /// Relay address (e.g. 127.0.0.1:4000)
        #[arg(long, default_value = "127.0.0.1:4000")]
        relay: String,
        /// Room backend base URL
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        api_url: String,
        /// Auth token for the backend and the relay
        #[arg(long, env = "CODEROOM_TOKEN")]
        token: String,
        /// Display name
        #[arg(long)]
        user: String,
        /// Account id; a fresh one is generated when omitted
        #[arg(long)]
        user_id: Option<Uuid>,
        /// Room id to open
        room: Uuid,
    },
    /// Room lifecycle operations against the backend
    Rooms {
        /// Room backend base URL
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        api_url: String,
        /// Auth token for the backend
        #[arg(long, env = "CODEROOM_TOKEN")]
        token: String,
        #[command(subcommand)]
        command: RoomsCommand,
    },
}

#[derive(Subcommand, Debug)]
enum RoomsCommand {
    /// List rooms
    List {
        /// Only public rooms
        #[arg(long)]
        public: bool,
    },
    /// Search rooms by name or tag
    Search { query: String },
    /// Show one room
    Show { id: Uuid },
    /// Join a room as a participant
    Join { id: Uuid },
    /// Create a room
    Create {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value = "plaintext")]
        language: String,
        #[arg(long, default_value = "dark")]
        theme: String,
        #[arg(long)]
        private: bool,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "coderoom=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Command::Serve { addr, data_dir } => server::run(&addr, &data_dir).await?,
        Command::Edit {
            relay,
            api_url,
            token,
            user,
            user_id,
            room,
        } => {
            let identity = Identity {
                user_id: user_id.unwrap_or_else(Uuid::new_v4),
                username: user,
                token,
            };
            if let Err(err) = tui::run(&relay, &api_url, identity, room).await {
                eprintln!("could not open room: {err}");
                eprintln!("try `coderoom rooms list` to find one");
                std::process::exit(1);
            }
        }
        Command::Rooms {
            api_url,
            token,
            command,
        } => {
            let api = HttpRoomApi::new(api_url, token)?;
            run_rooms_command(&api, command).await?;
        }
    }

    Ok(())
}

async fn run_rooms_command(api: &HttpRoomApi, command: RoomsCommand) -> Result<(), Box<dyn Error>> {
    match command {
        RoomsCommand::List { public } => {
            for room in api.list_rooms(public).await? {
                print_room_line(&room);
            }
        }
        RoomsCommand::Search { query } => {
            for room in api.search_rooms(&query).await? {
                print_room_line(&room);
            }
        }
        RoomsCommand::Show { id } => {
            let room = api.room_by_id(id).await?;
            print_room(&room);
        }
        RoomsCommand::Join { id } => {
            let room = api.join_room(id).await?;
            println!("joined '{}' ({} participants)", room.name, room.participants.len());
        }
        RoomsCommand::Create {
            name,
            description,
            language,
            theme,
            private,
            tags,
        } => {
            let room = api
                .create_room(NewRoom {
                    name,
                    description,
                    language,
                    theme,
                    is_private: private,
                    tags,
                    current_code: String::new(),
                })
                .await?;
            println!("created room {}", room.id);
        }
    }
    Ok(())
}

fn print_room_line(room: &Room) {
    let visibility = if room.is_private { "private" } else { "public" };
    println!(
        "{}  {:<24} {:<10} {} [{}]",
        room.id,
        room.name,
        room.language,
        visibility,
        room.tags.join(", ")
    );
}

fn print_room(room: &Room) {
    print_room_line(room);
    if !room.description.is_empty() {
        println!("  {}", room.description);
    }
    for participant in &room.participants {
        println!(
            "  - {} ({:?})",
            participant.username,
            participant.role
        );
    }
    println!("  updated {}", room.updated_at);
}
