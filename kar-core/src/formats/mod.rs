pub mod kar;
