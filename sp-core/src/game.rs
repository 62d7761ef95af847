//! Collaborator seams for the game side of the loop.
//!
//! The coordination core never looks inside a game; it drives whatever
//! implements [`Game`] and consults a [`Player`] for move selection. Real
//! engines and search live in their own crates.

use thiserror::Error;

use crate::tensor::Tensor;

#[derive(Debug, Error)]
pub enum GameError {
    #[error("action {action} is illegal in the current state")]
    IllegalAction { action: usize },
    #[error("game is already terminal")]
    Terminal,
    #[error("no legal action available")]
    NoLegalAction,
}

/// One playable game instance. Actions are flat indices into the game's
/// action space; the policy head shape is `raw_action_shape`.
pub trait Game: Send {
    /// Start a fresh episode.
    fn reset(&mut self);

    /// Legality mask over the flat action space, u8, 1 where legal.
    fn legal_mask(&self) -> Tensor;

    fn apply(&mut self, action: usize) -> Result<(), GameError>;

    fn is_terminal(&self) -> bool;

    /// Per-player results once terminal, else `None`.
    fn result(&self) -> Option<Vec<f32>>;

    /// Observation planes for the player to move, `[C, H, W]` f32.
    fn observation(&self) -> Tensor;

    /// Shape of the raw (spatial) action space.
    fn raw_action_shape(&self) -> Vec<usize>;

    fn player_to_move(&self) -> usize;

    fn num_players(&self) -> usize;
}

/// Move selection, whether scripted, human-driven or search-driven.
pub trait Player: Send {
    fn choose(&mut self, game: &dyn Game) -> Result<usize, GameError>;
}

/// Deterministic scripted player: always the lowest-index legal action.
/// Used as a baseline opponent and in tests.
#[derive(Debug, Default)]
pub struct FirstLegalPlayer;

impl Player for FirstLegalPlayer {
    fn choose(&mut self, game: &dyn Game) -> Result<usize, GameError> {
        let mask = game.legal_mask();
        let data = mask.as_u8().ok_or(GameError::NoLegalAction)?;
        data.iter()
            .position(|&m| m != 0)
            .ok_or(GameError::NoLegalAction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Toy game: count to three by picking any of two actions.
    struct CountToThree {
        moves: usize,
    }

    impl Game for CountToThree {
        fn reset(&mut self) {
            self.moves = 0;
        }

        fn legal_mask(&self) -> Tensor {
            let legal = if self.is_terminal() { 0 } else { 1 };
            Tensor::from_u8(vec![2], vec![legal; 2]).unwrap()
        }

        fn apply(&mut self, action: usize) -> Result<(), GameError> {
            if self.is_terminal() {
                return Err(GameError::Terminal);
            }
            if action >= 2 {
                return Err(GameError::IllegalAction { action });
            }
            self.moves += 1;
            Ok(())
        }

        fn is_terminal(&self) -> bool {
            self.moves >= 3
        }

        fn result(&self) -> Option<Vec<f32>> {
            self.is_terminal().then(|| vec![1.0])
        }

        fn observation(&self) -> Tensor {
            Tensor::from_f32(vec![1, 1, 1], vec![self.moves as f32]).unwrap()
        }

        fn raw_action_shape(&self) -> Vec<usize> {
            vec![2]
        }

        fn player_to_move(&self) -> usize {
            0
        }

        fn num_players(&self) -> usize {
            1
        }
    }

    #[test]
    fn scripted_player_plays_an_episode_to_the_end() {
        let mut game = CountToThree { moves: 0 };
        game.reset();
        let mut player = FirstLegalPlayer;
        while !game.is_terminal() {
            let action = player.choose(&game).unwrap();
            game.apply(action).unwrap();
        }
        assert_eq!(game.result(), Some(vec![1.0]));
        assert!(matches!(player.choose(&game), Err(GameError::NoLegalAction)));
        assert!(matches!(game.apply(0), Err(GameError::Terminal)));
    }
}
