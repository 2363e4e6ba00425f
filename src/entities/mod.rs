//! Database entities for the embedded store.

pub mod attendance;
pub mod configuration;
pub mod devices;
pub mod users;

pub mod prelude {
    pub use super::attendance::Entity as Attendance;
    pub use super::configuration::Entity as Configuration;
    pub use super::devices::Entity as Devices;
    pub use super::users::Entity as Users;
}
